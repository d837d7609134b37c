use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{report, Result, ResultExt};
use futures::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::debug;
use url::Url;

use super::{Config, EntityKind, Error, EventFeed, FeedStream, FeedUpdate};

impl EntityKind {
    fn fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::DeclaredDepositIntents => &[
                "messageHash",
                "contractAddress",
                "valueToken",
                "amount",
                "beneficiary",
                "feeGasPrice",
                "feeGasLimit",
                "depositor",
                "depositIntentHash",
                "blockNumber",
            ],
            EntityKind::DeclaredWithdrawIntents => &[
                "messageHash",
                "contractAddress",
                "utilityToken",
                "amount",
                "beneficiary",
                "feeGasPrice",
                "feeGasLimit",
                "withdrawer",
                "withdrawIntentHash",
                "blockNumber",
            ],
            EntityKind::ConfirmedDepositIntents | EntityKind::ConfirmedWithdrawIntents => {
                &["messageHash", "contractAddress"]
            }
            EntityKind::CreatedUtilityTokens => &[
                "valueTokenAddress",
                "utilityTokenAddress",
                "contractAddress",
            ],
        }
    }

    fn query(&self) -> String {
        format!(
            "query($uts: BigInt!, $first: Int!) {{ {entity}(first: $first, orderBy: uts, orderDirection: asc, where: {{ uts_gt: $uts }}) {{ {fields} uts }} }}",
            entity = self,
            fields = self.fields().join(" "),
        )
    }
}

/// Polls a subgraph GraphQL endpoint for new records of each subscribed entity kind.
///
/// Records are requested in `uts` order past a per-entity cursor that only moves when an update is
/// acknowledged, so every poll delivers again what was not handled yet. Clones share the cursors,
/// and a new subscription continues from the last acknowledged record.
#[derive(Clone)]
pub struct SubgraphFeed {
    client: reqwest::Client,
    url: Url,
    poll_interval: Duration,
    batch_size: usize,
    cursors: Arc<Mutex<HashMap<EntityKind, u64>>>,
}

impl SubgraphFeed {
    pub fn new(client: reqwest::Client, url: Url, config: &Config) -> Self {
        Self {
            client,
            url,
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            cursors: Arc::default(),
        }
    }

    fn cursor(&self, entity: EntityKind) -> u64 {
        self.cursors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entity)
            .copied()
            .unwrap_or_default()
    }

    fn advance_cursor(&self, entity: EntityKind, uts: u64) {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(entity).or_default();
        *cursor = (*cursor).max(uts);
    }

    async fn poll(&self, entity: EntityKind) -> Result<Option<FeedUpdate>, Error> {
        let cursor = self.cursor(entity);

        let body: Value = self
            .client
            .post(self.url.clone())
            .json(&json!({
                "query": entity.query(),
                "variables": { "uts": cursor.to_string(), "first": self.batch_size },
            }))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .change_context(Error::Transport)
            .attach_printable_lazy(|| format!("entity: {entity}"))?
            .json()
            .await
            .change_context(Error::InvalidResponse(entity))?;

        let (records, latest) = parse_response(entity, body)?;
        let Some(latest) = latest else {
            return Ok(None);
        };

        debug!(%entity, count = records.len(), from = cursor, to = latest, "polled subgraph");

        Ok(Some(FeedUpdate {
            entity,
            records,
            position: latest,
        }))
    }
}

/// Extracts the records of `entity` and the highest `uts` among them.
fn parse_response(entity: EntityKind, mut body: Value) -> Result<(Vec<Value>, Option<u64>), Error> {
    if let Some(errors) = body.get("errors") {
        return Err(report!(Error::Query(entity)).attach_printable(errors.to_string()));
    }

    let records = body
        .get_mut("data")
        .and_then(|data| data.get_mut(entity.to_string()))
        .map(Value::take);

    let records = match records {
        Some(Value::Array(records)) => records,
        other => {
            return Err(report!(Error::InvalidResponse(entity))
                .attach_printable(format!("records: {other:?}")))
        }
    };

    let latest = records
        .iter()
        .map(|record| {
            record
                .get("uts")
                .and_then(Value::as_str)
                .and_then(|uts| uts.parse::<u64>().ok())
                .ok_or(report!(Error::InvalidResponse(entity)))
                .attach_printable_lazy(|| format!("record: {record}"))
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .max();

    Ok((records, latest))
}

struct Polling {
    feed: SubgraphFeed,
    entities: Vec<EntityKind>,
    pending: VecDeque<Result<FeedUpdate, Error>>,
    interval: Interval,
}

#[async_trait]
impl EventFeed for SubgraphFeed {
    async fn subscribe(&self, entities: Vec<EntityKind>) -> Result<FeedStream, Error> {
        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let polling = Polling {
            feed: self.clone(),
            entities,
            pending: VecDeque::new(),
            interval,
        };

        Ok(stream::unfold(polling, |mut polling| async move {
            loop {
                if let Some(item) = polling.pending.pop_front() {
                    return Some((item, polling));
                }

                polling.interval.tick().await;
                for entity in &polling.entities {
                    match polling.feed.poll(*entity).await {
                        Ok(Some(update)) => polling.pending.push_back(Ok(update)),
                        Ok(None) => {}
                        Err(err) => polling.pending.push_back(Err(err)),
                    }
                }
            }
        })
        .boxed())
    }

    fn acknowledge(&self, entity: EntityKind, position: u64) {
        self.advance_cursor(entity, position);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, body_string_contains, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    /// Subgraph serving one record at `uts` 5 per entity kind past cursor 0, and nothing past 5.
    async fn subgraph(entities: &[EntityKind]) -> MockServer {
        let server = MockServer::start().await;

        for entity in entities {
            for (cursor, records) in [
                ("0", json!([{ "contractAddress": "0x01", "uts": "5" }])),
                ("5", json!([])),
            ] {
                Mock::given(method("POST"))
                    .and(body_string_contains(format!("{{ {entity}(")))
                    .and(body_partial_json(json!({ "variables": { "uts": cursor } })))
                    .respond_with(
                        ResponseTemplate::new(200)
                            .set_body_json(json!({ "data": { entity.to_string(): records } })),
                    )
                    .mount(&server)
                    .await;
            }
        }

        server
    }

    fn feed(server: &MockServer) -> SubgraphFeed {
        SubgraphFeed::new(
            reqwest::Client::new(),
            server.uri().parse().unwrap(),
            &Config {
                poll_interval: Duration::from_millis(10),
                batch_size: 10,
            },
        )
    }

    async fn next_update(stream: &mut FeedStream) -> FeedUpdate {
        tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn query_selects_entity_fields_past_the_cursor() {
        let query = EntityKind::CreatedUtilityTokens.query();

        assert!(query.starts_with("query($uts: BigInt!, $first: Int!) { createdUtilityTokens("));
        assert!(query.contains("where: { uts_gt: $uts }"));
        assert!(query.contains("{ valueTokenAddress utilityTokenAddress contractAddress uts }"));
    }

    #[test]
    fn response_records_and_latest_uts_are_extracted() {
        let body = json!({
            "data": {
                "confirmedDepositIntents": [
                    { "messageHash": "0x01", "contractAddress": "0x02", "uts": "17" },
                    { "messageHash": "0x03", "contractAddress": "0x04", "uts": "9" },
                ]
            }
        });

        let (records, latest) =
            parse_response(EntityKind::ConfirmedDepositIntents, body).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(latest, Some(17));
    }

    #[test]
    fn empty_response_has_no_latest_uts() {
        let body = json!({ "data": { "declaredDepositIntents": [] } });

        let (records, latest) = parse_response(EntityKind::DeclaredDepositIntents, body).unwrap();

        assert!(records.is_empty());
        assert_eq!(latest, None);
    }

    #[test]
    fn graphql_errors_are_reported() {
        let body = json!({ "errors": [{ "message": "unknown field" }] });

        let err = parse_response(EntityKind::DeclaredDepositIntents, body).unwrap_err();

        assert!(matches!(
            err.current_context(),
            Error::Query(EntityKind::DeclaredDepositIntents)
        ));
    }

    #[test]
    fn records_without_uts_are_rejected() {
        let body = json!({ "data": { "createdUtilityTokens": [{ "contractAddress": "0x01" }] } });

        assert!(parse_response(EntityKind::CreatedUtilityTokens, body).is_err());
    }

    #[test]
    fn cursors_only_move_forward_and_are_shared_between_clones() {
        let feed = SubgraphFeed::new(
            reqwest::Client::new(),
            "http://localhost:8000/subgraphs/name/facilitator".parse().unwrap(),
            &Config::default(),
        );
        let clone = feed.clone();

        feed.acknowledge(EntityKind::DeclaredWithdrawIntents, 10);
        clone.acknowledge(EntityKind::DeclaredWithdrawIntents, 5);

        assert_eq!(clone.cursor(EntityKind::DeclaredWithdrawIntents), 10);
        assert_eq!(feed.cursor(EntityKind::CreatedUtilityTokens), 0);
    }

    #[tokio::test]
    async fn updates_buffered_when_the_stream_is_dropped_are_delivered_to_the_next_subscription() {
        let entities = vec![
            EntityKind::DeclaredDepositIntents,
            EntityKind::CreatedUtilityTokens,
        ];
        let server = subgraph(&entities).await;
        let feed = feed(&server);

        let mut stream = feed.subscribe(entities.clone()).await.unwrap();
        let first = next_update(&mut stream).await;
        assert_eq!(first.entity, EntityKind::DeclaredDepositIntents);
        feed.acknowledge(first.entity, first.position);
        drop(stream);

        assert_eq!(feed.cursor(EntityKind::CreatedUtilityTokens), 0);

        let mut stream = feed.subscribe(entities).await.unwrap();
        let redelivered = next_update(&mut stream).await;
        assert_eq!(redelivered.entity, EntityKind::CreatedUtilityTokens);
        assert_eq!(redelivered.position, 5);
        assert_eq!(redelivered.records.len(), 1);
    }

    #[tokio::test]
    async fn unacknowledged_updates_are_polled_again() {
        let server = subgraph(&[EntityKind::ConfirmedWithdrawIntents]).await;
        let feed = feed(&server);

        let mut stream = feed
            .subscribe(vec![EntityKind::ConfirmedWithdrawIntents])
            .await
            .unwrap();

        let first = next_update(&mut stream).await;
        let second = next_update(&mut stream).await;
        assert_eq!(first, second);

        feed.acknowledge(second.entity, second.position);
        assert_eq!(feed.cursor(EntityKind::ConfirmedWithdrawIntents), 5);
        // nothing past the acknowledged record
        assert!(
            tokio::time::timeout(Duration::from_millis(100), stream.next())
                .await
                .is_err()
        );
    }
}
