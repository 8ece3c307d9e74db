//! Directory service.

use shallot_onion::directory::NodeDirectory;
use shallot_transport::messages::{Request, Response};
use shallot_transport::RequestHandler;
use shallot_types::network::NodeRegistryBody;
use tracing::info;

/// Serves `RegisterNode`, `GetNodeRegistry` and `Status`.
#[derive(Debug, Default)]
pub struct RegistryService {
    directory: NodeDirectory,
}

impl RegistryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }
}

impl RequestHandler for RegistryService {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Status => Response::Live,
            Request::RegisterNode(record) => {
                let id = record.id;
                self.directory.register(record.id, record.public_key).await;
                info!(node_id = id, "Node registered");
                Response::Ok
            }
            Request::GetNodeRegistry => Response::Registry(NodeRegistryBody {
                nodes: self.directory.list_all().await,
            }),
            other => Response::unsupported(&other),
        }
    }
}

#[cfg(test)]
mod tests {
    use shallot_types::network::RelayRecord;

    use super::*;

    fn register(id: u32, key: &str) -> Request {
        Request::RegisterNode(RelayRecord {
            id,
            public_key: key.to_string(),
        })
    }

    #[tokio::test]
    async fn test_register_then_list() {
        let registry = RegistryService::new();
        assert_eq!(registry.handle(Request::Status).await, Response::Live);
        assert_eq!(registry.handle(register(1, "a")).await, Response::Ok);
        assert_eq!(registry.handle(register(1, "b")).await, Response::Ok);

        let body = registry
            .handle(Request::GetNodeRegistry)
            .await
            .expect_registry()
            .expect("registry");
        assert_eq!(body.nodes.len(), 2);
        assert_eq!(body.nodes[1].public_key, "b");
        assert_eq!(registry.directory().distinct_ids().await, 1);
    }

    #[tokio::test]
    async fn test_rejects_other_requests() {
        let registry = RegistryService::new();
        let resp = registry.handle(Request::GetDiagnostics).await;
        assert!(matches!(resp, Response::Error { .. }));
    }
}
