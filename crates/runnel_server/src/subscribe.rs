//! SSE subscriptions.
//!
//! `GET /subscribe?stream=...` or `?category=...` attaches a subscriber to
//! the namespace's poke bus. Each poke becomes one `event: poke` frame
//! carrying either the stream name or the category, never both. With a
//! starting `position`, existing messages at or past that global position
//! are synthesised as pokes from a storage read before the live feed takes
//! over; the handoff keeps delivered global positions monotonic.
//!
//! Delivery is best-effort: a subscriber that cannot keep up misses pokes
//! and is expected to re-read from the store on each one it does receive.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Extension;
use futures::Stream;
use runnel::{ConsumerGroup, Message};
use runnel_store::{
    GetCategoryOptions, Subscription, SubscriptionFilter, DEFAULT_BATCH_SIZE,
};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{require_namespace, Auth};
use crate::error::ApiError;
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEP_ALIVE_TEXT: &str = "keep-alive";

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    stream: Option<String>,
    category: Option<String>,
    correlation: Option<String>,
    member: Option<u64>,
    size: Option<u64>,
    position: Option<u64>,
}

/// Catch-up parameters for a category subscription with a starting
/// position.
struct CatchUp {
    category: String,
    correlation: Option<String>,
    consumer_group: Option<ConsumerGroup>,
    position: u64,
}

pub async fn handle(
    State(state): State<AppState>,
    Extension(auth): Extension<Auth>,
    Query(query): Query<SubscribeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let namespace = require_namespace(&auth)?.clone();
    let (filter, catch_up) = build_filter(query)?;

    // Register the live subscription before the catch-up read so the
    // handoff cannot miss a window.
    let subscription = state.bus.subscribe(&namespace.id, filter.clone());
    let stream = poke_stream(state, namespace.id, filter, catch_up, subscription);

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text(KEEP_ALIVE_TEXT),
    ))
}

fn build_filter(query: SubscribeQuery) -> Result<(SubscriptionFilter, Option<CatchUp>), ApiError> {
    match (query.stream, query.category) {
        (Some(stream_name), None) => {
            if query.correlation.is_some()
                || query.member.is_some()
                || query.size.is_some()
                || query.position.is_some()
            {
                return Err(ApiError::invalid_request(
                    "stream subscriptions accept no category options",
                ));
            }

            Ok((SubscriptionFilter::Stream { stream_name }, None))
        }
        (None, Some(category)) => {
            let consumer_group = match (query.member, query.size) {
                (Some(member), Some(size)) => Some(
                    ConsumerGroup::new(member, size)
                        .map_err(|err| ApiError::invalid_request(err.to_string()))?,
                ),
                (None, None) => None,
                _ => {
                    return Err(ApiError::invalid_request(
                        "member and size must be given together",
                    ))
                }
            };

            let catch_up = query.position.map(|position| CatchUp {
                category: category.clone(),
                correlation: query.correlation.clone(),
                consumer_group,
                position,
            });

            Ok((
                SubscriptionFilter::Category {
                    category,
                    correlation: query.correlation,
                    consumer_group,
                },
                catch_up,
            ))
        }
        _ => Err(ApiError::invalid_request(
            "exactly one of stream or category is required",
        )),
    }
}

fn poke_stream(
    state: AppState,
    ns: String,
    filter: SubscriptionFilter,
    catch_up: Option<CatchUp>,
    mut subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        let mut last_delivered: Option<u64> = None;

        if let Some(catch_up) = catch_up {
            let mut from = catch_up.position;
            loop {
                let batch = state
                    .store
                    .category_messages(
                        &ns,
                        &catch_up.category,
                        GetCategoryOptions {
                            position: from,
                            batch_size: DEFAULT_BATCH_SIZE,
                            correlation: catch_up.correlation.clone(),
                            consumer_group: catch_up.consumer_group,
                        },
                    )
                    .await;

                match batch {
                    Ok(batch) => {
                        let full = batch.len() == DEFAULT_BATCH_SIZE as usize;
                        for message in &batch {
                            last_delivered = Some(message.global_position);
                            yield Ok(catch_up_event(message));
                        }
                        match (full, batch.last().map(|m| m.global_position)) {
                            (true, Some(last)) => from = last + 1,
                            _ => break,
                        }
                    }
                    Err(err) => {
                        yield Ok(error_event(&ApiError::from_store(err)));
                        return;
                    }
                }
            }
        }

        while let Some(poke) = subscription.recv().await {
            // Skip anything the catch-up read already delivered.
            if last_delivered.map_or(false, |last| poke.global_position <= last) {
                continue;
            }
            last_delivered = Some(poke.global_position);
            yield Ok(live_event(&filter, &poke));
        }
    }
}

fn live_event(filter: &SubscriptionFilter, poke: &runnel::Poke) -> Event {
    let payload = match filter {
        SubscriptionFilter::Stream { .. } => json!({
            "stream": poke.stream_name,
            "position": poke.position,
            "globalPosition": poke.global_position,
        }),
        SubscriptionFilter::Category { .. } => json!({
            "category": poke.category,
            "position": poke.position,
            "globalPosition": poke.global_position,
        }),
    };

    Event::default().event("poke").json_data(payload).unwrap()
}

fn catch_up_event(message: &Message<'_>) -> Event {
    let payload = json!({
        "category": message.stream_name.category(),
        "position": message.position,
        "globalPosition": message.global_position,
    });

    Event::default().event("poke").json_data(payload).unwrap()
}

fn error_event(err: &ApiError) -> Event {
    let payload = json!({
        "code": err.code.as_str(),
        "message": err.message,
    });

    Event::default().event("error").json_data(payload).unwrap()
}
