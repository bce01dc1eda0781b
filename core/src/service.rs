//! Service table: resolves service names to numeric ids and schema ids, and
//! partitions services into the ones this endpoint implements (`local`) and
//! the ones the peer implements (`remote`).

use crate::error::{ErrorKind, TsrpcError};
use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Api,
    Msg,
}

/// Which endpoint implements a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceSide {
    Server,
    Client,
    Both,
}

impl ServiceSide {
    #[inline]
    fn is_local_to(self, endpoint: EndpointSide) -> bool {
        match self {
            Self::Both => true,
            Self::Server => endpoint == EndpointSide::Server,
            Self::Client => endpoint == EndpointSide::Client,
        }
    }
}

/// The role of this endpoint in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSide {
    Server,
    Client,
}

impl EndpointSide {
    #[inline]
    pub fn other(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }
}

/// Raw service descriptor as authored in a proto.
#[derive(Debug, Clone)]
pub struct ServiceDef {
    pub id: u32,
    pub name: String,
    pub kind: ServiceKind,
    pub side: ServiceSide,
}

/// Schema metadata exchanged opportunistically so peers can detect skew.
///
/// Carried in an HTTP header or an in-band field; it never changes
/// semantics, a mismatch is only logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProtoInfo {
    #[serde(rename = "lastModified")]
    pub last_modified: String,
    pub md5: String,
    pub tsrpc: String,
    pub node: String,
}

impl ProtoInfo {
    /// Stamp the framework and runtime versions of this build.
    pub fn of_build(last_modified: impl Into<String>, md5: impl Into<String>) -> Self {
        Self {
            last_modified: last_modified.into(),
            md5: md5.into(),
            tsrpc: env!("CARGO_PKG_VERSION").to_string(),
            node: "rust".to_string(),
        }
    }
}

/// The authored protocol: service list plus optional version metadata.
#[derive(Debug, Clone, Default)]
pub struct ServiceProto {
    pub services: Vec<ServiceDef>,
    pub version: Option<ProtoInfo>,
}

#[derive(Debug)]
pub struct ApiService {
    pub id: u32,
    pub name: String,
    pub side: ServiceSide,
    pub req_schema_id: String,
    pub res_schema_id: String,
}

#[derive(Debug)]
pub struct MsgService {
    pub id: u32,
    pub name: String,
    pub side: ServiceSide,
    pub msg_schema_id: String,
}

#[derive(Debug, Clone)]
pub enum Service {
    Api(Arc<ApiService>),
    Msg(Arc<MsgService>),
}

impl Service {
    #[inline]
    pub fn id(&self) -> u32 {
        match self {
            Self::Api(s) => s.id,
            Self::Msg(s) => s.id,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        match self {
            Self::Api(s) => &s.name,
            Self::Msg(s) => &s.name,
        }
    }

    #[inline]
    pub fn as_api(&self) -> Option<&Arc<ApiService>> {
        match self {
            Self::Api(s) => Some(s),
            Self::Msg(_) => None,
        }
    }

    #[inline]
    pub fn as_msg(&self) -> Option<&Arc<MsgService>> {
        match self {
            Self::Msg(s) => Some(s),
            Self::Api(_) => None,
        }
    }
}

/// Built once from a [ServiceProto]; read-only afterwards, O(1) lookups.
pub struct ServiceMap {
    side: EndpointSide,
    by_id: FxHashMap<u32, Service>,
    by_name: FxHashMap<String, Service>,
    local_api: FxHashMap<String, Arc<ApiService>>,
    remote_api: FxHashMap<String, Arc<ApiService>>,
    local_msg: FxHashMap<String, Arc<MsgService>>,
    remote_msg: FxHashMap<String, Arc<MsgService>>,
    version: Option<ProtoInfo>,
}

impl ServiceMap {
    /// Fails only if `proto` contains duplicate service ids.
    pub fn build(proto: &ServiceProto, side: EndpointSide) -> Result<Self, TsrpcError> {
        let mut map = Self {
            side,
            by_id: FxHashMap::default(),
            by_name: FxHashMap::default(),
            local_api: FxHashMap::default(),
            remote_api: FxHashMap::default(),
            local_msg: FxHashMap::default(),
            remote_msg: FxHashMap::default(),
            version: proto.version.clone(),
        };
        for def in &proto.services {
            let (path, base) = split_service_name(&def.name);
            let service = match def.kind {
                ServiceKind::Api => {
                    let api = Arc::new(ApiService {
                        id: def.id,
                        name: def.name.clone(),
                        side: def.side,
                        req_schema_id: format!("{}Ptl{}/Req{}", path, base, base),
                        res_schema_id: format!("{}Ptl{}/Res{}", path, base, base),
                    });
                    if def.side.is_local_to(side) {
                        map.local_api.insert(def.name.clone(), api.clone());
                    }
                    if def.side.is_local_to(side.other()) {
                        map.remote_api.insert(def.name.clone(), api.clone());
                    }
                    Service::Api(api)
                }
                ServiceKind::Msg => {
                    let msg = Arc::new(MsgService {
                        id: def.id,
                        name: def.name.clone(),
                        side: def.side,
                        msg_schema_id: format!("{}Msg{}/Msg{}", path, base, base),
                    });
                    if def.side.is_local_to(side) {
                        map.local_msg.insert(def.name.clone(), msg.clone());
                    }
                    if def.side.is_local_to(side.other()) {
                        map.remote_msg.insert(def.name.clone(), msg.clone());
                    }
                    Service::Msg(msg)
                }
            };
            if map.by_id.insert(def.id, service.clone()).is_some() {
                return Err(TsrpcError::new(
                    ErrorKind::LocalError,
                    format!("Duplicate service id {} ({})", def.id, def.name),
                ));
            }
            map.by_name.insert(def.name.clone(), service);
        }
        Ok(map)
    }

    #[inline]
    pub fn side(&self) -> EndpointSide {
        self.side
    }

    #[inline]
    pub fn version(&self) -> Option<&ProtoInfo> {
        self.version.as_ref()
    }

    #[inline]
    pub fn get_by_name(&self, name: &str) -> Option<&Service> {
        self.by_name.get(name)
    }

    #[inline]
    pub fn get_by_id(&self, id: u32) -> Option<&Service> {
        self.by_id.get(&id)
    }

    /// API services this endpoint implements.
    #[inline]
    pub fn local_api(&self) -> &FxHashMap<String, Arc<ApiService>> {
        &self.local_api
    }

    /// API services the peer implements (callable from here).
    #[inline]
    pub fn remote_api(&self, name: &str) -> Option<&Arc<ApiService>> {
        self.remote_api.get(name)
    }

    #[inline]
    pub fn local_msg(&self, name: &str) -> Option<&Arc<MsgService>> {
        self.local_msg.get(name)
    }

    #[inline]
    pub fn remote_msg(&self, name: &str) -> Option<&Arc<MsgService>> {
        self.remote_msg.get(name)
    }
}

/// Split `(path/)?name` into the path prefix (with trailing slash, possibly
/// empty) and the bare name.
fn split_service_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('/') {
        Some((_, base)) => (&name[..name.len() - base.len()], base),
        None => ("", name),
    }
}
