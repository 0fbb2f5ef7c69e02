use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::engine::Engine;
use crate::core::registry::FieldClass;
use crate::core::stats::Statistics;
use crate::error::{Error, ErrorKind};

pub const RPC_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Requests accepted on the local endpoint, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "req", rename_all = "snake_case")]
pub enum Request {
    ListContainers,
    Create { name: String },
    Destroy { name: String },
    Start { name: String },
    Stop { name: String, timeout_ms: Option<u64> },
    Pause { name: String },
    Resume { name: String },
    GetProperty { name: String, key: String },
    SetProperty { name: String, key: String, value: String },
    GetData { name: String, key: String, index: Option<String> },
    ListProperties,
    ListVolumeProperties,
    Wait { name: String, timeout_ms: u64 },
    GetVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub desc: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Payload {
    #[default]
    None,
    Value(String),
    Names(Vec<String>),
    Fields(Vec<FieldInfo>),
}

/// Every response carries the taxonomy kind, its stable wire value, and a
/// human-readable description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub error: ErrorKind,
    pub error_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    pub description: String,
    #[serde(default, skip_serializing_if = "payload_is_none")]
    pub payload: Payload,
}

fn payload_is_none(p: &Payload) -> bool {
    matches!(p, Payload::None)
}

impl Response {
    pub fn ok(payload: Payload) -> Self {
        Self {
            error: ErrorKind::Success,
            error_code: ErrorKind::Success.wire_value(),
            errno: None,
            description: String::new(),
            payload,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            error: err.kind,
            error_code: err.kind.wire_value(),
            errno: err.errno,
            description: err.msg.clone(),
            payload: Payload::None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error == ErrorKind::Success
    }
}

fn list_containers(engine: &Engine) -> Vec<String> {
    let tree = engine.tree.lock().expect("tree lock poisoned");
    let mut names: Vec<String> = tree
        .subtree_breadth_first(&tree.root())
        .iter()
        .filter(|ct| !ct.is_root())
        .map(|ct| ct.name.clone())
        .collect();
    names.sort();
    names
}

fn list_fields(engine: &Engine) -> Vec<FieldInfo> {
    let mut out = Vec::new();
    for class in [FieldClass::Property, FieldClass::Data] {
        for field in engine.registry.list(class) {
            out.push(FieldInfo {
                name: field.key.to_string(),
                desc: field.desc.to_string(),
                read_only: class == FieldClass::Data
                    || field.flags.has(crate::core::registry::FieldFlags::READ_ONLY),
            });
        }
    }
    out
}

/// Serve one request against the engine.
pub fn dispatch(engine: &Arc<Engine>, request: Request) -> Response {
    Statistics::bump(&engine.stats.requests);
    let result = match request {
        Request::ListContainers => Ok(Payload::Names(list_containers(engine))),
        Request::Create { name } => engine.create(&name).map(|_| Payload::None),
        Request::Destroy { name } => engine.destroy(&name).map(|_| Payload::None),
        Request::Start { name } => engine.start(&name).map(|_| Payload::None),
        Request::Stop { name, timeout_ms } => engine
            .stop(&name, Duration::from_millis(timeout_ms.unwrap_or(5_000)))
            .map(|_| Payload::None),
        Request::Pause { name } => engine.pause(&name).map(|_| Payload::None),
        Request::Resume { name } => engine.resume(&name).map(|_| Payload::None),
        Request::GetProperty { name, key } => {
            engine.get_property(&name, &key).map(Payload::Value)
        }
        Request::SetProperty { name, key, value } => {
            engine.set_property(&name, &key, &value).map(|_| Payload::None)
        }
        Request::GetData { name, key, index } => engine
            .get_data(&name, &key, index.as_deref())
            .map(Payload::Value),
        Request::ListProperties => Ok(Payload::Fields(list_fields(engine))),
        // the volume layer is an external collaborator; its property list
        // is empty here
        Request::ListVolumeProperties => Ok(Payload::Fields(Vec::new())),
        Request::Wait { name, timeout_ms } => engine
            .wait_death(&name, Duration::from_millis(timeout_ms))
            .map(|state| Payload::Value(state.to_string())),
        Request::GetVersion => Ok(Payload::Value(RPC_VERSION.to_string())),
    };
    match result {
        Ok(payload) => Response::ok(payload),
        Err(err) => {
            Statistics::bump(&engine.stats.errors);
            Response::from_error(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::store::Store;
    use crate::platform::linux::cgroups::CgroupDriver;
    use crate::platform::linux::net::tests_support::fake_network;

    fn test_engine() -> (tempfile::TempDir, Arc<Engine>) {
        let tmp = tempfile::tempdir().unwrap();
        let cgroups = CgroupDriver::scratch(&tmp.path().join("cgroup"), &["memory"]).unwrap();
        let store = Store::open(&tmp.path().join("state")).unwrap();
        let engine = Engine::with_parts(Config::default(), cgroups, fake_network(), Some(store));
        (tmp, engine)
    }

    #[test]
    fn request_wire_format() {
        let req: Request =
            serde_json::from_str(r#"{"req":"create","name":"/a"}"#).unwrap();
        assert_eq!(req, Request::Create { name: "/a".into() });

        let req: Request = serde_json::from_str(
            r#"{"req":"get_data","name":"/a","key":"stdout","index":"128"}"#,
        )
        .unwrap();
        assert_eq!(
            req,
            Request::GetData {
                name: "/a".into(),
                key: "stdout".into(),
                index: Some("128".into()),
            }
        );
    }

    #[test]
    fn create_list_destroy_flow() {
        let (_tmp, engine) = test_engine();
        assert!(dispatch(&engine, Request::Create { name: "/a".into() }).is_success());
        assert!(dispatch(&engine, Request::Create { name: "/a/b".into() }).is_success());

        let resp = dispatch(&engine, Request::ListContainers);
        assert_eq!(
            resp.payload,
            Payload::Names(vec!["/a".to_string(), "/a/b".to_string()])
        );

        assert!(dispatch(&engine, Request::Destroy { name: "/a".into() }).is_success());
        let resp = dispatch(&engine, Request::ListContainers);
        assert_eq!(resp.payload, Payload::Names(Vec::new()));
    }

    #[test]
    fn errors_carry_kind_and_wire_value() {
        let (_tmp, engine) = test_engine();
        let resp = dispatch(&engine, Request::Start { name: "/ghost".into() });
        assert_eq!(resp.error, ErrorKind::NotFound);
        assert_eq!(resp.error_code, ErrorKind::NotFound.wire_value());
        assert!(!resp.description.is_empty());

        let resp = dispatch(&engine, Request::Create { name: "bad name".into() });
        assert_eq!(resp.error, ErrorKind::InvalidValue);
    }

    #[test]
    fn duplicate_create_is_exists() {
        let (_tmp, engine) = test_engine();
        dispatch(&engine, Request::Create { name: "/a".into() });
        let resp = dispatch(&engine, Request::Create { name: "/a".into() });
        assert_eq!(resp.error, ErrorKind::Exists);
    }

    #[test]
    fn property_flow_over_rpc() {
        let (_tmp, engine) = test_engine();
        dispatch(&engine, Request::Create { name: "/a".into() });
        assert!(dispatch(
            &engine,
            Request::SetProperty {
                name: "/a".into(),
                key: "command".into(),
                value: "/bin/true".into(),
            }
        )
        .is_success());
        let resp = dispatch(
            &engine,
            Request::GetProperty { name: "/a".into(), key: "command".into() },
        );
        assert_eq!(resp.payload, Payload::Value("/bin/true".into()));

        // read-only data field rejects writes with invalid_property
        let resp = dispatch(
            &engine,
            Request::SetProperty {
                name: "/a".into(),
                key: "exit_status".into(),
                value: "1".into(),
            },
        );
        assert_eq!(resp.error, ErrorKind::InvalidProperty);
    }

    #[test]
    fn listings_include_both_classes_and_hide_hidden() {
        let (_tmp, engine) = test_engine();
        let resp = dispatch(&engine, Request::ListProperties);
        let Payload::Fields(fields) = resp.payload else {
            panic!("expected fields");
        };
        let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"command"));
        assert!(names.contains(&"state"));
        assert!(!names.contains(&"parent"));

        let resp = dispatch(&engine, Request::ListVolumeProperties);
        assert_eq!(resp.payload, Payload::Fields(Vec::new()));
    }

    #[test]
    fn version_is_reported() {
        let (_tmp, engine) = test_engine();
        let resp = dispatch(&engine, Request::GetVersion);
        assert_eq!(resp.payload, Payload::Value(RPC_VERSION.into()));
    }

    #[test]
    fn wait_times_out_with_taxonomy_kind() {
        let (_tmp, engine) = test_engine();
        dispatch(&engine, Request::Create { name: "/a".into() });
        engine
            .container("/a")
            .unwrap()
            .lock()
            .set_state(crate::core::container::ContainerState::Running);
        let resp = dispatch(
            &engine,
            Request::Wait { name: "/a".into(), timeout_ms: 20 },
        );
        assert_eq!(resp.error, ErrorKind::Timeout);
    }
}
