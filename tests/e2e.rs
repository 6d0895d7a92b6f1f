//! End-to-end scenarios against the public `Manager` API, exercising real
//! Unix sockets and real child processes. Styled after the integration
//! tests in `systemd-rs/crates/resolved` in this codebase, which also drive
//! a whole daemon through `tempfile`-backed sockets rather than mocking.

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use resolverd::config::{Config, ExecutableSpec, ServiceSpec};
use resolverd::error::{Error, RpcError};
use resolverd::supervisor::Manager;

fn control_address(dir: &tempfile::TempDir) -> String {
    format!("unix:{}", dir.path().join("control.sock").display())
}

/// Send one varlink-style request over `stream` (NUL-terminated JSON) and
/// read the NUL-terminated JSON reply back from it.
fn wire_call(stream: &mut UnixStream, method: &str, parameters: Value) -> Value {
    let mut request = serde_json::to_vec(&json!({ "method": method, "parameters": parameters })).unwrap();
    request.push(0);
    stream.write_all(&request).unwrap();

    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).unwrap();
        assert_ne!(n, 0, "connection closed before a reply arrived");
        if byte[0] == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    serde_json::from_slice(&buf).unwrap()
}

fn unmanaged(address: &str, interfaces: &[&str]) -> ServiceSpec {
    ServiceSpec {
        address: address.to_owned(),
        interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        executable: None,
        config_path: None,
        activate_at_startup: false,
    }
}

#[test]
fn resolve_miss_returns_interface_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(&control_address(&dir)).unwrap();

    let err = manager.resolve("com.example.Nope").unwrap_err();
    assert_eq!(err, RpcError::InterfaceNotFound);
}

#[test]
fn resolve_hit_returns_registered_address() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&control_address(&dir)).unwrap();

    manager
        .add_service(unmanaged("unix:/tmp/does-not-need-to-exist.sock", &["com.example.A"]))
        .unwrap();

    let service = manager.resolve("com.example.A").unwrap();
    assert_eq!(service.address, "unix:/tmp/does-not-need-to-exist.sock");
}

#[test]
fn add_services_rejects_duplicate_interface() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&control_address(&dir)).unwrap();

    manager.add_service(unmanaged("unix:/tmp/a.sock", &["com.example.A"])).unwrap();
    let err = manager
        .add_service(unmanaged("unix:/tmp/b.sock", &["com.example.A"]))
        .unwrap_err();

    assert!(matches!(err, Error::NotUnique(name) if name == "com.example.A"));
}

#[test]
fn readd_same_address_replaces_without_growing_table() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&control_address(&dir)).unwrap();

    manager.add_service(unmanaged("unix:/tmp/a.sock", &["com.example.A"])).unwrap();
    manager.add_service(unmanaged("unix:/tmp/a.sock", &["com.example.B"])).unwrap();

    assert_eq!(manager.services().len(), 1);
    assert_eq!(manager.resolve("com.example.A").unwrap_err(), RpcError::InterfaceNotFound);
    assert_eq!(manager.resolve("com.example.B").unwrap().address, "unix:/tmp/a.sock");
}

#[test]
fn loading_config_registers_its_services() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &config_path,
        r#"{"services": [{"address": "unix:/tmp/from-config.sock", "interfaces": ["com.example.Configured"]}]}"#,
    )
    .unwrap();

    let config: Config = serde_json::from_slice(&std::fs::read(&config_path).unwrap()).unwrap();
    let mut manager = Manager::new(&control_address(&dir)).unwrap();
    for spec in config.services {
        manager.add_service(spec).unwrap();
    }

    assert!(manager.resolve("com.example.Configured").is_ok());
}

/// Connecting to a managed, dormant service's own listener is the
/// activation trigger. After the child (`/bin/true`) exits cleanly, the
/// supervisor rebinds the listener and the service returns to Dormant.
#[test]
fn activation_spawns_and_reaps_a_clean_child() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&control_address(&dir)).unwrap();

    let service_sock = dir.path().join("svc.sock");
    manager
        .add_service(ServiceSpec {
            address: format!("unix:{}", service_sock.display()),
            interfaces: vec!["com.example.Activatable".to_owned()],
            executable: Some(ExecutableSpec { path: "/bin/true".to_owned(), uid: 0, gid: 0 }),
            config_path: None,
            activate_at_startup: false,
        })
        .unwrap();

    assert!(service_sock.exists(), "dormant service should have bound its listener");

    let connector = std::thread::spawn({
        let path = service_sock.clone();
        move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = UnixStream::connect(&path);
        }
    });

    // One step to activate (readiness on the service's listener), one more
    // to reap the exit (readiness on the signal channel).
    manager.step().unwrap();
    manager.step().unwrap();
    connector.join().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while manager.services()[0].pid.is_some() && Instant::now() < deadline {
        manager.step().unwrap();
    }

    assert!(manager.services()[0].pid.is_none(), "child should have been reaped");
    assert!(!manager.services()[0].failed, "a clean exit must not be treated as a crash");
}

/// The activation protocol hands the child fd 3 with `LISTEN_FDS=1` and its
/// own pid in `LISTEN_PID`; a shell child can observe both.
#[test]
fn activated_child_receives_the_listener_on_fd_three() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("probe.sh");
    let marker_path = dir.path().join("fd3_ok");
    std::fs::write(
        &script_path,
        format!(
            "#!/bin/sh\nif [ \"$LISTEN_FDS\" = \"1\" ] && [ \"$LISTEN_PID\" = \"$$\" ]; then\n  : <&3 2>/dev/null && echo ok > {}\nfi\n",
            marker_path.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut manager = Manager::new(&control_address(&dir)).unwrap();
    let service_sock = dir.path().join("svc.sock");
    manager
        .add_service(ServiceSpec {
            address: format!("unix:{}", service_sock.display()),
            interfaces: vec!["com.example.Probe".to_owned()],
            executable: Some(ExecutableSpec { path: script_path.to_string_lossy().into_owned(), uid: 0, gid: 0 }),
            config_path: None,
            activate_at_startup: false,
        })
        .unwrap();

    let connector = std::thread::spawn({
        let path = service_sock.clone();
        move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = UnixStream::connect(&path);
        }
    });
    manager.step().unwrap();
    connector.join().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !marker_path.exists() && Instant::now() < deadline {
        manager.step().unwrap();
    }

    let mut contents = String::new();
    std::fs::File::open(&marker_path)
        .expect("script should have observed fd 3 and written the marker")
        .read_to_string(&mut contents)
        .unwrap();
    assert_eq!(contents.trim(), "ok");
}

/// Drives the admin RPC surface the way a real varlink client would: a
/// `UnixStream` connected to the control socket, NUL-terminated JSON in
/// both directions, decoded by `ipc::accept_and_dispatch`/`rpc::dispatch`
/// rather than called as a Rust API directly.
#[test]
fn resolve_over_the_wire_returns_registered_address() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&control_address(&dir)).unwrap();
    manager
        .add_service(unmanaged("unix:/tmp/does-not-need-to-exist.sock", &["com.example.Wire"]))
        .unwrap();

    let control_path = dir.path().join("control.sock");
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        let mut stream = UnixStream::connect(&control_path).unwrap();
        wire_call(&mut stream, "org.varlink.resolver.Resolve", json!({ "interface": "com.example.Wire" }))
    });

    manager.step().unwrap();
    let reply = handle.join().unwrap();

    assert_eq!(reply["parameters"]["address"], "unix:/tmp/does-not-need-to-exist.sock");
}

/// Regression coverage for the `AddServices`/`GetConfig` wire contract: a
/// `uid`/`gid` field-name mismatch between the two would be invisible to
/// any test that only calls `Manager`'s Rust API directly.
#[test]
fn add_services_round_trips_user_and_group_id_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&control_address(&dir)).unwrap();
    let control_path = dir.path().join("control.sock");
    let service_sock = dir.path().join("wire-test.sock");

    let handle = std::thread::spawn({
        let control_path = control_path.clone();
        let service_address = format!("unix:{}", service_sock.display());
        move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut stream = UnixStream::connect(&control_path).unwrap();
            let add_reply = wire_call(
                &mut stream,
                "org.varlink.activator.AddServices",
                json!({
                    "services": [{
                        "address": service_address,
                        "interfaces": ["com.example.Wire"],
                        "executable": {
                            "path": "/bin/true",
                            "user_id": 4242,
                            "group_id": 4343,
                        },
                    }],
                }),
            );
            drop(stream);

            std::thread::sleep(Duration::from_millis(50));
            let mut stream = UnixStream::connect(&control_path).unwrap();
            let config_reply = wire_call(&mut stream, "org.varlink.activator.GetConfig", json!({}));
            (add_reply, config_reply, service_address)
        }
    });

    manager.step().unwrap();
    manager.step().unwrap();

    let (add_reply, config_reply, service_address) = handle.join().unwrap();
    assert!(add_reply.get("error").is_none(), "AddServices failed: {add_reply:?}");

    let services = config_reply["parameters"]["services"].as_array().unwrap();
    let service = services.iter().find(|s| s["address"] == service_address).unwrap();
    assert_eq!(service["executable"]["user_id"].as_u64().unwrap(), 4242);
    assert_eq!(service["executable"]["group_id"].as_u64().unwrap(), 4343);
}

/// A service whose child exits nonzero is marked Failed and is not
/// reactivated until the global backoff elapses.
#[test]
fn crashing_child_is_marked_failed_until_backoff_elapses() {
    let dir = tempfile::tempdir().unwrap();
    let mut manager = Manager::new(&control_address(&dir)).unwrap();

    let service_sock = dir.path().join("svc.sock");
    manager
        .add_service(ServiceSpec {
            address: format!("unix:{}", service_sock.display()),
            interfaces: vec!["com.example.Flaky".to_owned()],
            executable: Some(ExecutableSpec { path: "/bin/false".to_owned(), uid: 0, gid: 0 }),
            config_path: None,
            activate_at_startup: false,
        })
        .unwrap();

    let connector = std::thread::spawn({
        let path = service_sock.clone();
        move || {
            std::thread::sleep(Duration::from_millis(50));
            let _ = UnixStream::connect(&path);
        }
    });
    manager.step().unwrap();
    connector.join().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !manager.services()[0].failed && Instant::now() < deadline {
        manager.step().unwrap();
    }
    assert!(manager.services()[0].failed, "a nonzero exit must be treated as a crash");
}
