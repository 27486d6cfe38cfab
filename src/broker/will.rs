//! Will delivery.
//!
//! A will is evaluated once per session end: the publish authorization hook
//! runs with no originating client, the message is fanned out when allowed
//! and the stored record is removed whatever the decision was. Hook and
//! persistence failures surface on the broker error channel with their
//! message intact.

use std::sync::Arc;

use tracing::{debug, info};

use crate::persistence::WillRecord;
use crate::protocol::{Publish, Will};

use super::Broker;

/// Evaluate the will of a session that ended on this broker
pub(super) async fn evaluate(broker: &Broker, client_id: &Arc<str>, will: Will) {
    let publish = Publish {
        topic: Arc::from(will.topic.as_str()),
        payload: will.payload,
        qos: will.qos,
        retain: will.retain,
        ..Publish::default()
    };
    publish_and_forget(broker, client_id, publish).await;
}

/// Deliver the will a dead sibling broker left behind
pub(super) async fn deliver_orphan(broker: &Broker, record: WillRecord) {
    info!(
        "delivering will of client {} for dead broker {}",
        record.client_id, record.broker_id
    );
    let client_id = record.client_id.clone();
    let publish = record.to_publish();
    publish_and_forget(broker, &client_id, publish).await;
}

async fn publish_and_forget(broker: &Broker, client_id: &Arc<str>, publish: Publish) {
    match broker.hooks.authorize_publish(None, &publish).await {
        Ok(true) => {
            if let Err(err) = broker.route(publish).await {
                broker.report_error("publishing will", &err);
            }
        }
        Ok(false) => {
            debug!("will of client {} denied by authorization", client_id);
        }
        Err(err) => {
            broker.report_error("authorizing will", &err);
        }
    }

    // The record is spent once a decision was reached, deny included
    if let Err(err) = broker.persistence.del_will(client_id).await {
        broker.report_error("deleting will", &err);
    }
}
