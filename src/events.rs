//! Subscriptions and the notification bus: a single per-node pub/sub
//! listener fronted by `fred`, fanning out to per-session SSE channels held
//! in-process via `tokio::sync::broadcast`. Grounded in the teacher's
//! `Chat::publish`/`Chat::subscribe` pair (`examples/chat/src/chat.rs`),
//! which holds a `(broadcast::Sender, broadcast::Receiver)` the same way;
//! here the sender side is additionally mirrored onto a Redis channel so
//! multiple server nodes observe the same commits.

use diesel::sql_types::{Nullable, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl as AsyncRunQueryDsl;
use fred::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::db::Connection;
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionRef {
    pub id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "nodeId")]
    pub node_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub message: EnvelopeMessage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopeMessage {
    pub subscription: SubscriptionRef,
    pub action: ChangeAction,
    pub data: Value,
}

/// One process-wide notification bus. `sender` is cloned into every SSE
/// connection's task; the `fred` client mirrors every locally-originated
/// notification to a Redis channel so other nodes' listeners see it too.
pub struct EventBus {
    node_id: String,
    sender: broadcast::Sender<Envelope>,
    redis: Client,
}

impl EventBus {
    pub async fn connect(redis_url: &str, node_id: String) -> Result<Self> {
        let config = Config::from_url(redis_url)
            .map_err(|error| crate::err!(500, message = format!("invalid REDIS_URL: {error}")))?;
        let client = Builder::from_config(config)
            .build()
            .map_err(|error| crate::err!(500, message = format!("failed to build redis client: {error}")))?;
        client
            .init()
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to connect to redis: {error}")))?;

        let (sender, _receiver) = broadcast::channel(1024);
        Ok(Self { node_id, sender, redis: client })
    }

    pub fn subscribe_local(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Opens a `LISTEN` on the channel named after this node and hands
    /// parsed, sanitized payloads to the local broadcast sender. Exactly
    /// one listener runs per node, spawned once at startup.
    pub async fn listen(&self) -> Result<()> {
        let subscriber = self.redis.clone_new();
        subscriber
            .subscribe(self.node_id.clone())
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to subscribe to node channel: {error}")))?;

        let mut message_stream = subscriber.message_rx();
        let sender = self.sender.clone();

        tokio::spawn(async move {
            while let Ok(message) = message_stream.recv().await {
                let Some(raw) = message.value.as_str() else {
                    continue;
                };
                let Ok(mut envelope) = serde_json::from_str::<Envelope>(&raw) else {
                    continue;
                };
                envelope.message.data = crate::tools::sanitize(&envelope.message.data);
                let _ = sender.send(envelope);
            }
        });

        Ok(())
    }

    /// Publishes `envelope` to every node holding a subscription row for
    /// the changed object id (or its feather), per the notification
    /// contract: CRUD calls this once per commit.
    pub async fn notify(&self, conn: &mut Connection<'_>, target: &str, envelope_template: EnvelopeMessage) -> Result<()> {
        let nodes: Vec<NodeRow> = diesel::sql_query(
            "SELECT DISTINCT node_id, session_id, subscription_id FROM subscription WHERE target = $1",
        )
        .bind::<Text, _>(target.to_owned())
        .load(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to list subscribers: {error}")))?;

        for node in nodes {
            let envelope = Envelope {
                message: EnvelopeMessage {
                    subscription: SubscriptionRef {
                        id: node.subscription_id,
                        session_id: node.session_id,
                        node_id: node.node_id.clone(),
                    },
                    action: envelope_template.action,
                    data: envelope_template.data.clone(),
                },
            };
            let payload = serde_json::to_string(&envelope).expect("envelope serializes");
            let _: std::result::Result<(), _> = self.redis.publish(node.node_id, payload).await;
        }

        Ok(())
    }
}

#[derive(QueryableByName)]
struct NodeRow {
    #[diesel(sql_type = Text)]
    node_id: String,
    #[diesel(sql_type = Text)]
    session_id: String,
    #[diesel(sql_type = Text)]
    subscription_id: String,
}

pub struct SubscribeRequest<'a> {
    pub node_id: &'a str,
    pub session_id: &'a str,
    pub subscription_id: &'a str,
    pub merge: bool,
}

/// Requires `nodeId`/`sessionId`/`subscriptionId`. Unless `merge` is set,
/// any prior rows for that subscription id are first deleted. Inserts one
/// row per id, plus one for `feather` when given so inserts into the
/// feather become notifications even before a matching id exists.
pub async fn subscribe(
    conn: &mut Connection<'_>,
    request: SubscribeRequest<'_>,
    ids: &[String],
    feather: Option<&str>,
) -> Result<()> {
    if !request.merge {
        diesel::sql_query("DELETE FROM subscription WHERE subscription_id = $1")
            .bind::<Text, _>(request.subscription_id.to_owned())
            .execute(conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to clear prior subscription rows: {error}")))?;
    }

    let mut targets: Vec<String> = ids.to_vec();
    if let Some(feather) = feather {
        targets.push(feather.to_owned());
    }

    for target in targets {
        diesel::sql_query(
            "INSERT INTO subscription (node_id, session_id, subscription_id, target)
             VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
        )
        .bind::<Text, _>(request.node_id.to_owned())
        .bind::<Text, _>(request.session_id.to_owned())
        .bind::<Text, _>(request.subscription_id.to_owned())
        .bind::<Text, _>(target)
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to subscribe: {error}")))?;
    }

    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub enum UnsubscribeScope {
    Subscription,
    Session,
    Node,
}

/// Deletes matching rows for the given scope. Calling with an empty id
/// resolves without error (a no-op, not a 400).
pub async fn unsubscribe(conn: &mut Connection<'_>, id: &str, scope: UnsubscribeScope) -> Result<()> {
    if id.is_empty() {
        return Ok(());
    }

    let column = match scope {
        UnsubscribeScope::Subscription => "subscription_id",
        UnsubscribeScope::Session => "session_id",
        UnsubscribeScope::Node => "node_id",
    };

    diesel::sql_query(format!("DELETE FROM subscription WHERE {column} = $1"))
        .bind::<Text, _>(id.to_owned())
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to unsubscribe: {error}")))?;

    Ok(())
}

#[allow(dead_code)]
#[derive(QueryableByName)]
struct OptionalText {
    #[diesel(sql_type = Nullable<Text>)]
    value: Option<String>,
}
