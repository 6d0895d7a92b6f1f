//! Admin RPC surface: the four methods bound to the control
//! IPC, dispatched from a decoded `ipc::Call`. Grounded on the four varlink
//! method handlers (`manager_resolve`, `manager_get_info`, ...) in
//! `examples/original_source/src/main.c`.

use serde_json::{json, Value};

use crate::error::RpcError;
use crate::ipc::Call;
use crate::supervisor::Manager;

const VENDOR: &str = "Example Vendor";
const PRODUCT: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Decode `parameters`, run the named method against `manager`, and write
/// the reply (or typed error) back on `call`'s connection.
pub fn dispatch(manager: &mut Manager, method: &str, parameters: Value, call: Call) {
    let result = match method {
        "org.varlink.resolver.Resolve" => resolve(manager, &parameters),
        "org.varlink.resolver.GetInfo" => Ok(get_info(manager)),
        "org.varlink.activator.GetConfig" => Ok(get_config(manager)),
        "org.varlink.activator.AddServices" => add_services(manager, &parameters).map(|()| Value::Object(Default::default())),
        other => {
            log::warn!("unknown method requested: {other}");
            Err(RpcError::InvalidParameter("method".to_owned()))
        }
    };

    let write_result = match result {
        Ok(reply) => call.reply(reply),
        Err(ref e) => call.reply_error(e),
    };
    if let Err(e) = write_result {
        log::debug!("failed to write RPC reply for {method}: {e}");
    }
}

fn resolve(manager: &Manager, parameters: &Value) -> Result<Value, RpcError> {
    let interface = parameters
        .get("interface")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::InvalidParameter("interface".to_owned()))?;

    let service = manager.resolve(interface)?;
    Ok(json!({ "address": service.address }))
}

fn get_info(manager: &Manager) -> Value {
    json!({
        "vendor": VENDOR,
        "product": PRODUCT,
        "version": VERSION,
        "interfaces": manager.interfaces().collect::<Vec<_>>(),
    })
}

fn get_config(manager: &Manager) -> Value {
    let services: Vec<Value> = manager
        .services()
        .iter()
        .map(|s| {
            json!({
                "address": s.address,
                "interfaces": s.interfaces,
                "executable": s.executable.as_ref().map(|e| json!({
                    "path": e.path.to_string_lossy(),
                    "user_id": e.uid,
                    "group_id": e.gid,
                })),
                "activate_at_startup": s.activate_at_startup,
            })
        })
        .collect();

    json!({
        "vendor": VENDOR,
        "product": PRODUCT,
        "version": VERSION,
        "services": services,
    })
}

/// Every entry in `services` is parsed and added to the table
/// unconditionally, then the interface index is rebuilt once for the whole
/// batch. A uniqueness collision is only detectable at that trailing
/// rebuild, so it cannot keep a later, otherwise-valid entry in the same
/// request from being added.
fn add_services(manager: &mut Manager, parameters: &Value) -> Result<(), RpcError> {
    let entries = parameters
        .get("services")
        .and_then(Value::as_array)
        .ok_or_else(|| RpcError::InvalidParameter("services".to_owned()))?;

    let specs = entries
        .iter()
        .map(|entry| {
            serde_json::from_value(entry.clone()).map_err(|_| RpcError::InvalidParameter("services".to_owned()))
        })
        .collect::<Result<Vec<crate::config::ServiceSpec>, RpcError>>()?;

    manager.add_services(specs).map_err(map_add_error)
}

fn map_add_error(e: crate::error::Error) -> RpcError {
    match e {
        crate::error::Error::NotUnique(name) => RpcError::NotUnique(name),
        crate::error::Error::ListenerFailed { source, .. } => RpcError::ListenerFailed(source.to_string()),
        crate::error::Error::InvalidSpec(msg) => RpcError::InvalidParameter(msg),
        other => RpcError::ListenerFailed(other.to_string()),
    }
}
