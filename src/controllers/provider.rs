//! `kafka-client` provider
//!
//! Each client relation gets its own SCRAM user, `relation-<id>`, whose
//! password lives in the cluster peer application bag so every broker (and
//! the next leader) can see it. The leader publishes the connection details
//! into the client's relation.

use tracing::warn;

use crate::controllers::resolver::DesiredConfig;
use crate::error::Result;
use crate::model::databags::{
    client_username, encode, ClientConnection, ClientRequest, PeerAppData, PeerUnitData, TlsFlag,
};
use crate::model::relation::{DataBag, Interface, Relation, RelationId, RelationSet};
use crate::model::unit::UnitId;
use crate::settings::OperatorSettings;

/// `host:port` of every broker that has published its address, sorted
pub fn broker_endpoints(
    relations: &RelationSet,
    members: &[UnitId],
    port: u16,
) -> Result<Vec<String>> {
    let cluster = match relations.get(Interface::Cluster) {
        Some(cluster) => cluster,
        None => return Ok(Vec::new()),
    };
    let mut endpoints = Vec::new();
    for unit in members {
        let data = PeerUnitData::from_bag(&cluster.unit_bag(unit))?;
        if let Some(address) = data.private_address {
            endpoints.push(format!("{}:{}", address, port));
        }
    }
    endpoints.sort();
    endpoints.dedup();
    Ok(endpoints)
}

/// Client port advertised to applications
pub fn client_port(settings: &OperatorSettings, desired: &DesiredConfig) -> u16 {
    if desired.tls_enabled() {
        settings.ports.client_tls
    } else {
        settings.ports.client
    }
}

/// Client relations that have published a well-formed request. A malformed
/// request only costs its own relation.
pub fn client_requests(relations: &RelationSet) -> Vec<(&Relation, ClientRequest)> {
    let mut requests = Vec::new();
    for relation in relations.all(Interface::KafkaClient) {
        match ClientRequest::from_bag(&relation.remote_app_bag()) {
            Ok(Some(request)) => requests.push((relation, request)),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    relation_id = relation.id,
                    app = %relation.remote_app,
                    error = %e,
                    "Ignoring malformed client request"
                );
            }
        }
    }
    requests
}

/// Passwords kept for client relations that no longer exist
pub fn stale_client_passwords(peer_app: &PeerAppData, relations: &RelationSet) -> Vec<RelationId> {
    peer_app
        .client_passwords
        .keys()
        .copied()
        .filter(|id| {
            relations
                .by_id(*id)
                .map(|r| r.interface != Interface::KafkaClient)
                .unwrap_or(true)
        })
        .collect()
}

/// Application bag the leader publishes on a client relation
pub fn connection_bag(
    relation: &Relation,
    password: &str,
    desired: &DesiredConfig,
    endpoints: Vec<String>,
) -> Result<DataBag> {
    let request_echo = serde_json::to_string(&relation.remote_app_bag())?;
    let connection = ClientConnection {
        username: client_username(relation.id),
        password: password.to_string(),
        endpoints,
        zookeeper_uris: desired.zookeeper_connect.clone(),
        consumer_group_prefix: format!("{}-", client_username(relation.id)),
        tls: TlsFlag::from_enabled(desired.tls_enabled()),
        data: request_echo,
    };
    encode(&connection)
}
