//! Concurrent multi-query search
//!
//! Every query runs as its own leg. Legs are polled together and their
//! results interleave in arrival order, which is not deterministic. A leg
//! that fails ends with a `Failed` event; it never affects its siblings.

use super::{ResultStream, SearchBackend, SearchOptions};
use crate::retrieval::PrimaryResult;
use futures::stream::{self, BoxStream, StreamExt};
use lexforge_common::errors::AppError;
use lexforge_common::metrics;
use std::sync::Arc;
use std::time::Instant;

/// Event produced by a fan-out leg
#[derive(Debug)]
pub enum LegEvent {
    Hit {
        query_index: usize,
        result: PrimaryResult,
    },
    Failed {
        query_index: usize,
        query: String,
        /// Name of the backend that served the leg
        backend: String,
        error: AppError,
    },
}

enum Leg {
    Pending {
        backend: Arc<dyn SearchBackend>,
        query: String,
        options: SearchOptions,
        index: usize,
    },
    Streaming {
        backend: Arc<dyn SearchBackend>,
        results: ResultStream,
        query: String,
        index: usize,
        started: Instant,
        hits: usize,
    },
    Done,
}

impl Leg {
    async fn step(mut self) -> Option<(LegEvent, Leg)> {
        loop {
            self = match self {
                Leg::Pending {
                    backend,
                    query,
                    options,
                    index,
                } => {
                    let started = Instant::now();
                    let searched = backend.search(&query, &options).await;
                    match searched {
                        Ok(results) => Leg::Streaming {
                            backend,
                            results,
                            query,
                            index,
                            started,
                            hits: 0,
                        },
                        Err(error) => {
                            let event = fail(backend.name(), query, index, started, error);
                            return Some((event, Leg::Done));
                        }
                    }
                }
                Leg::Streaming {
                    backend,
                    mut results,
                    query,
                    index,
                    started,
                    hits,
                } => match results.next().await {
                    Some(Ok(result)) => {
                        let event = LegEvent::Hit {
                            query_index: index,
                            result,
                        };
                        let next = Leg::Streaming {
                            backend,
                            results,
                            query,
                            index,
                            started,
                            hits: hits + 1,
                        };
                        return Some((event, next));
                    }
                    Some(Err(error)) => {
                        let event = fail(backend.name(), query, index, started, error);
                        return Some((event, Leg::Done));
                    }
                    None => {
                        metrics::record_search_leg(started.elapsed().as_secs_f64(), "ok");
                        tracing::debug!(
                            backend = backend.name(),
                            query = %query,
                            hits = hits,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Search leg completed"
                        );
                        return None;
                    }
                },
                Leg::Done => return None,
            };
        }
    }
}

fn fail(backend: &str, query: String, index: usize, started: Instant, error: AppError) -> LegEvent {
    metrics::record_search_leg(started.elapsed().as_secs_f64(), "error");
    tracing::warn!(
        backend,
        query = %query,
        query_index = index,
        error = %error,
        "Search leg failed, continuing without it"
    );
    LegEvent::Failed {
        query_index: index,
        query,
        backend: backend.to_string(),
        error,
    }
}

/// Run every query concurrently and merge their events in arrival order.
/// The stream ends once every leg has finished or failed.
pub fn fan_out(
    backend: Arc<dyn SearchBackend>,
    queries: &[String],
    options: SearchOptions,
) -> BoxStream<'static, LegEvent> {
    let legs = queries.iter().enumerate().map(|(index, query)| {
        let leg = Leg::Pending {
            backend: backend.clone(),
            query: query.clone(),
            options: options.clone(),
            index,
        };
        stream::unfold(leg, Leg::step).boxed()
    });

    stream::select_all(legs).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::MockSearchBackend;
    use std::collections::HashSet;

    fn page(nid: i64, chunk_no: i64) -> PrimaryResult {
        PrimaryResult {
            nid,
            chunk_no,
            url: format!("https://clic.org.hk/{}/{}", nid, chunk_no),
            ..Default::default()
        }
    }

    fn queries(items: &[&str]) -> Vec<String> {
        items.iter().map(|q| q.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failed_leg_does_not_block_siblings() {
        let backend = Arc::new(
            MockSearchBackend::new()
                .with_results("q1", vec![page(1, 0), page(2, 0)])
                .with_failure("q2")
                .with_results("q3", vec![page(3, 0)]),
        );

        let events: Vec<LegEvent> = fan_out(
            backend.clone(),
            &queries(&["q1", "q2", "q3"]),
            SearchOptions::default(),
        )
        .collect()
        .await;

        let hits: HashSet<(i64, i64)> = events
            .iter()
            .filter_map(|e| match e {
                LegEvent::Hit { result, .. } => Some(result.key()),
                _ => None,
            })
            .collect();
        assert_eq!(hits, HashSet::from([(1, 0), (2, 0), (3, 0)]));

        let failed: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                LegEvent::Failed { query_index, .. } => Some(*query_index),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![1]);
        assert_eq!(backend.distinct_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_interrupted_leg_keeps_earlier_hits() {
        let backend = Arc::new(MockSearchBackend::new().with_interruption("q1", vec![page(7, 0)]));

        let events: Vec<LegEvent> =
            fan_out(backend, &queries(&["q1"]), SearchOptions::default())
                .collect()
                .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], LegEvent::Hit { result, .. } if result.nid == 7));
        assert!(matches!(
            &events[1],
            LegEvent::Failed { query, backend, .. } if query == "q1" && backend == "mock"
        ));
    }

    #[tokio::test]
    async fn test_hits_carry_their_query_index() {
        let backend = Arc::new(
            MockSearchBackend::new()
                .with_results("a", vec![page(1, 0)])
                .with_results("b", vec![page(2, 0)]),
        );

        let events: Vec<LegEvent> =
            fan_out(backend, &queries(&["a", "b"]), SearchOptions::default())
                .collect()
                .await;

        for event in events {
            if let LegEvent::Hit {
                query_index,
                result,
            } = event
            {
                assert_eq!(query_index as i64 + 1, result.nid);
            }
        }
    }

    #[tokio::test]
    async fn test_no_queries() {
        let backend = Arc::new(MockSearchBackend::new());
        let events: Vec<LegEvent> = fan_out(backend, &[], SearchOptions::default()).collect().await;
        assert!(events.is_empty());
    }
}
