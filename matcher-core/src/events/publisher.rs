use uuid::Uuid;

use matcher_shared::clients::rabbitmq::RabbitMQClient;
use matcher_shared::types::event::{payloads, routing_keys, Event};

pub async fn publish_match_created(
    rabbitmq: &RabbitMQClient,
    chat_id: Uuid,
    user_a_id: Uuid,
    user_b_id: Uuid,
) {
    let event = Event::new(
        "matcher-core",
        routing_keys::MATCH_CREATED,
        payloads::MatchCreated {
            chat_id,
            user_a_id,
            user_b_id,
        },
    )
    .with_user(user_a_id);

    if let Err(e) = rabbitmq.publish(routing_keys::MATCH_CREATED, &event).await {
        tracing::error!(error = %e, "failed to publish match.created event");
    }
}

pub async fn publish_chat_ended(
    rabbitmq: &RabbitMQClient,
    chat_id: Uuid,
    user_a_id: Uuid,
    user_b_id: Uuid,
    duration_secs: i64,
    end_reason: &str,
) {
    let event = Event::new(
        "matcher-core",
        routing_keys::CHAT_ENDED,
        payloads::ChatEnded {
            chat_id,
            user_a_id,
            user_b_id,
            duration_secs,
            end_reason: end_reason.to_string(),
        },
    )
    .with_user(user_a_id);

    if let Err(e) = rabbitmq.publish(routing_keys::CHAT_ENDED, &event).await {
        tracing::error!(error = %e, "failed to publish chat.ended event");
    }
}
