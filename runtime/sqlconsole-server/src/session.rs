//! One persistent channel turned into a strictly sequential series of
//! request/response exchanges.

use std::future::Future;
use std::sync::Arc;

use sqlconsole_db::{CancelToken, Store};
use thiserror::Error;

use crate::executor;
use crate::protocol::{self, CodecError, Frame};

/// Duplex message transport owned by a single session.
pub trait Channel: Send {
    /// Next data frame, or `None` once the peer has closed the channel.
    fn receive(&mut self) -> impl Future<Output = Result<Option<Frame>, SessionError>> + Send;

    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), SessionError>> + Send;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    PeerClosed,
    Cancelled,
}

/// Transport faults. Each one ends the session without a response.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("undecodable request: {0}")]
    Decode(CodecError),
    #[error("response encoding failed: {0}")]
    Encode(CodecError),
}

pub struct Session<S, C> {
    store: Arc<S>,
    channel: C,
    cancel: CancelToken,
}

impl<S: Store, C: Channel> Session<S, C> {
    pub fn new(store: Arc<S>, channel: C, cancel: CancelToken) -> Self {
        Self {
            store,
            channel,
            cancel,
        }
    }

    /// Serves requests until the peer leaves, the token fires or the
    /// transport fails. Dropping `self` releases the channel.
    pub async fn run(mut self) -> Result<SessionEnd, SessionError> {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                received = self.channel.receive() => received?,
            };
            let Some(frame) = received else {
                return Ok(SessionEnd::PeerClosed);
            };
            let (request, codec) = protocol::decode_request(&frame).map_err(SessionError::Decode)?;

            let Some(response) =
                executor::execute(self.store.as_ref(), &request.query, &self.cancel).await
            else {
                return Ok(SessionEnd::Cancelled);
            };

            let frame = protocol::encode_response(&response, codec).map_err(SessionError::Encode)?;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Cancelled),
                sent = self.channel.send(frame) => sent?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStore, memory_channel, sqlite_store};
    use serde_json::{Value, json};
    use std::time::Duration;

    fn query(text: &str) -> Frame {
        Frame::Text(json!({ "Query": text }).to_string())
    }

    fn body(frame: Frame) -> Value {
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).expect("json"),
            Frame::Binary(_) => panic!("expected a text frame"),
        }
    }

    fn without_duration(mut value: Value) -> Value {
        if let Some(object) = value.as_object_mut() {
            object.remove("duration");
        }
        value
    }

    /// Feeds `frames`, closes the inbound side and collects every response.
    async fn converse<S: Store>(
        store: Arc<S>,
        frames: Vec<Frame>,
    ) -> (Result<SessionEnd, SessionError>, Vec<Frame>) {
        let (channel, mut peer) = memory_channel();
        for frame in frames {
            peer.to_server.send(frame).expect("queue frame");
        }
        drop(peer.to_server);
        let outcome = Session::new(store, channel, CancelToken::new()).run().await;
        let mut responses = Vec::new();
        while let Ok(frame) = peer.from_server.try_recv() {
            responses.push(frame);
        }
        (outcome, responses)
    }

    #[tokio::test]
    async fn select_returns_columns_rows_and_duration() {
        let (_dir, store) = sqlite_store();
        let (outcome, responses) = converse(store, vec![query("SELECT 1 AS x")]).await;
        assert_eq!(outcome.expect("outcome"), SessionEnd::PeerClosed);
        assert_eq!(responses.len(), 1);
        let response = body(responses[0].clone());
        assert_eq!(response["columns"], json!(["x"]));
        assert_eq!(response["rows"], json!([[1]]));
        let duration = response["duration"].as_str().expect("duration");
        assert!(!duration.is_empty());
        assert!(response.get("err").is_none());
        assert!(response.get("stats").is_none());
    }

    #[tokio::test]
    async fn stats_returns_only_pool_telemetry() {
        let (_dir, store) = sqlite_store();
        let (_, responses) = converse(store, vec![query("stats")]).await;
        let response = body(responses.into_iter().next().expect("response"));
        let object = response.as_object().expect("object");
        assert_eq!(object.keys().collect::<Vec<_>>(), vec!["stats"]);
        assert!(response["stats"]["MaxOpenConnections"].as_u64().is_some());
    }

    #[tokio::test]
    async fn query_fault_keeps_session_alive() {
        let (_dir, store) = sqlite_store();
        let (outcome, responses) = converse(
            store,
            vec![query("SELECT * FROM missing_table"), query("SELECT 1 AS x")],
        )
        .await;
        assert_eq!(outcome.expect("outcome"), SessionEnd::PeerClosed);
        assert_eq!(responses.len(), 2);

        let failure = body(responses[0].clone());
        assert_eq!(failure, json!({ "err": "no such table: missing_table" }));

        let success = without_duration(body(responses[1].clone()));
        assert_eq!(success, json!({ "columns": ["x"], "rows": [[1]] }));
    }

    #[tokio::test]
    async fn malformed_frame_ends_session_silently() {
        let store = Arc::new(FakeStore::default());
        let (outcome, responses) = converse(
            Arc::clone(&store),
            vec![Frame::Text("{\"Query\":".into()), query("SELECT 1")],
        )
        .await;
        assert!(matches!(outcome, Err(SessionError::Decode(_))));
        assert!(responses.is_empty());
        assert_eq!(store.query_count(), 0);
    }

    #[tokio::test]
    async fn binary_frames_get_binary_responses() {
        let (_dir, store) = sqlite_store();
        let request = rmp_serde::to_vec_named(&json!({ "Query": "SELECT 'a' AS s" })).expect("encode");
        let (_, responses) = converse(store, vec![Frame::Binary(request)]).await;
        let Some(Frame::Binary(bytes)) = responses.into_iter().next() else {
            panic!("expected a binary response");
        };
        let decoded: Value = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(decoded["columns"], json!(["s"]));
        assert_eq!(decoded["rows"], json!([["a"]]));
    }

    #[tokio::test]
    async fn cancellation_while_idle_ends_without_response() {
        let (channel, mut peer) = memory_channel();
        let cancel = CancelToken::new();
        let session = Session::new(Arc::new(FakeStore::default()), channel, cancel.child());
        let handle = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let outcome = handle.await.expect("join");
        assert_eq!(outcome.expect("outcome"), SessionEnd::Cancelled);
        assert!(peer.from_server.try_recv().is_err());
        drop(peer.to_server);
    }

    #[tokio::test]
    async fn cancellation_aborts_running_query() {
        let (_dir, store) = sqlite_store();
        let (channel, mut peer) = memory_channel();
        let cancel = CancelToken::new();
        peer.to_server
            .send(query(
                "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) SELECT count(*) FROM n",
            ))
            .expect("queue frame");
        let handle = tokio::spawn(Session::new(store, channel, cancel.child()).run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session stops")
            .expect("join");
        assert_eq!(outcome.expect("outcome"), SessionEnd::Cancelled);
        assert!(peer.from_server.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_failure_is_a_transport_fault() {
        let (channel, peer) = memory_channel();
        peer.to_server.send(query("stats")).expect("queue frame");
        drop(peer.from_server);
        let outcome = Session::new(Arc::new(FakeStore::default()), channel, CancelToken::new())
            .run()
            .await;
        assert!(matches!(outcome, Err(SessionError::Send(_))));
    }
}
