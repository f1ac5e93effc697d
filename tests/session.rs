//! Tests for inbound routing, correlation and the outbound send queue of a `Session`.

use std::{sync::Arc, time::Duration};

use rstest::{fixture, rstest};
use tracing_test::traced_test;
use wiregate::{
    broker::MemoryBroker,
    config::GatewayConfig,
    correlation::RequestError,
    fragment::{ERROR_COMMAND, MessageId, ReassemblyError},
    message::LogicalMessage,
    session::{Inbound, InboundError, PING_COMMAND},
};

mod common;
use common::{FailingDispatcher, RecordingDispatcher, session_with, wire, wire_part};

#[fixture]
fn config() -> GatewayConfig { GatewayConfig::default() }

#[rstest]
#[tokio::test]
async fn request_resolves_on_matching_reply(config: GatewayConfig) {
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let requester = Arc::clone(&session);
    let request = tokio::spawn(async move {
        requester
            .send_request(LogicalMessage::new("query", "{}").with_id("q1"))
            .await
    });

    let sent = written.next_fragment().await;
    assert_eq!(sent.identity(), &MessageId::new("q1"));
    assert_eq!(sent.reply_to(), None);
    assert_eq!(session.pending_requests(), 1);

    let outcome = session
        .receive_fragment(&wire("q1", Some("q1"), "query", "[1,2]"))
        .await
        .expect("reply admitted");
    assert_eq!(outcome, Inbound::Resolved(MessageId::new("q1")));

    let reply = request.await.expect("join").expect("reply");
    assert_eq!(reply.data(), "[1,2]");
    assert_eq!(session.pending_requests(), 0);
}

#[rstest]
#[tokio::test]
async fn reply_for_other_identity_is_dispatched(config: GatewayConfig) {
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    let (session, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let requester = Arc::clone(&session);
    let _request = tokio::spawn(async move {
        requester
            .send_request(LogicalMessage::new("query", "{}").with_id("mine"))
            .await
    });
    written.next_fragment().await;

    let outcome = session
        .receive_fragment(&wire("theirs", Some("theirs"), "query", "late"))
        .await
        .expect("reply admitted");
    assert_eq!(outcome, Inbound::Dispatched(MessageId::new("theirs")));

    let message = dispatched.recv().await.expect("dispatched");
    assert_eq!(message.data(), "late");
    assert_eq!(session.pending_requests(), 1);
}

#[rstest]
#[tokio::test]
async fn request_without_reply_marker_is_not_resolved(config: GatewayConfig) {
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    let (session, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let requester = Arc::clone(&session);
    let _request = tokio::spawn(async move {
        requester
            .send_request(LogicalMessage::new("query", "{}").with_id("q2"))
            .await
    });
    written.next_fragment().await;

    let outcome = session
        .receive_fragment(&wire("q2", None, "query", "echo"))
        .await
        .expect("message admitted");
    assert_eq!(outcome, Inbound::Dispatched(MessageId::new("q2")));
    assert_eq!(dispatched.recv().await.expect("dispatched").data(), "echo");
    assert_eq!(session.pending_requests(), 1);
}

#[rstest]
#[tokio::test]
async fn close_rejects_pending_requests(config: GatewayConfig) {
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let requester = Arc::clone(&session);
    let request = tokio::spawn(async move {
        requester
            .send_request(LogicalMessage::new("query", "{}"))
            .await
    });
    written.next_fragment().await;

    session.close().await;

    assert_eq!(
        request.await.expect("join"),
        Err(RequestError::ConnectionClosed)
    );
    assert!(transport.is_closed());
    assert!(session.is_closed());
    assert_eq!(
        session.send_request(LogicalMessage::new("query", "{}")).await,
        Err(RequestError::ConnectionClosed)
    );
    assert!(matches!(
        session.receive_fragment(&wire("x", None, "query", "")).await,
        Err(InboundError::Closed)
    ));
}

#[rstest]
#[tokio::test]
async fn reply_cannot_be_sent_as_request(config: GatewayConfig) {
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let reply = LogicalMessage::new("query", "x")
        .with_id("r1")
        .with_reply_to("r1");
    assert_eq!(
        session.send_request(reply).await,
        Err(RequestError::NotARequest(MessageId::new("r1")))
    );
    assert!(written.drain().is_empty());
    assert_eq!(session.pending_requests(), 0);
}

#[rstest]
#[tokio::test]
async fn error_reply_rejects_request(config: GatewayConfig) {
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let requester = Arc::clone(&session);
    let request = tokio::spawn(async move {
        requester
            .send_request(LogicalMessage::new("insert", "{}").with_id("w1"))
            .await
    });
    written.next_fragment().await;

    let reply = r#"{"id":"w1","replyto":"w1","command":"insert","data":"","error":"access denied"}"#;
    session.receive_fragment(reply).await.expect("reply admitted");

    assert_eq!(
        request.await.expect("join"),
        Err(RequestError::Remote("access denied".into()))
    );
}

#[rstest]
#[case::not_json("not json", None)]
#[case::zero_count(r#"{"id":"bad1","count":0}"#, Some("bad1"))]
#[tokio::test]
async fn malformed_frame_answers_with_error(
    config: GatewayConfig,
    #[case] raw: &str,
    #[case] reply_to: Option<&str>,
) {
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let err = session
        .receive_fragment(raw)
        .await
        .expect_err("frame rejected");
    assert!(matches!(err, InboundError::Frame(_)));

    let answer = written.next_fragment().await;
    assert_eq!(answer.command(), ERROR_COMMAND);
    assert_eq!(answer.error(), Some(err.to_string().as_str()));
    assert_eq!(answer.reply_to(), reply_to.map(MessageId::new).as_ref());
    assert!(!session.is_closed());
}

#[rstest]
#[tokio::test]
async fn dispatch_failure_is_reported_to_peer(config: GatewayConfig) {
    let (session, _transport, mut written) = session_with(
        config,
        Arc::new(FailingDispatcher("no such collection")),
        Arc::new(MemoryBroker::new()),
    );

    session
        .receive_fragment(&wire("req7", None, "query", "{}"))
        .await
        .expect("request admitted");

    let answer = written.next_fragment().await;
    assert_eq!(answer.identity(), &MessageId::new("req7"));
    assert_eq!(answer.reply_to(), Some(&MessageId::new("req7")));
    assert_eq!(answer.command(), "query");
    assert_eq!(answer.payload(), "no such collection");
    assert_eq!(answer.error(), Some("no such collection"));
}

#[rstest]
#[tokio::test]
async fn large_reply_is_fragmented_and_reassembled_in_any_order(config: GatewayConfig) {
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (sender, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let payload: String = ('a'..='z').cycle().take(1300).collect();
    let request = LogicalMessage::new("query", "").with_id("big");
    sender
        .send_reply(LogicalMessage::reply_to(&request, payload.clone()))
        .await
        .expect("reply queued");

    let fragments = written.drain();
    let sizes: Vec<_> = fragments
        .iter()
        .map(|f| (f.index(), f.count(), f.payload().chars().count()))
        .collect();
    assert_eq!(sizes, vec![(0, 3, 500), (1, 3, 500), (2, 3, 300)]);

    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    let (receiver, _transport, _written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));
    let mut outcomes = Vec::new();
    for fragment in fragments.iter().rev() {
        let raw = fragment.to_wire().expect("encode");
        outcomes.push(receiver.receive_fragment(&raw).await.expect("admit"));
    }
    assert_eq!(
        outcomes,
        vec![
            Inbound::Incomplete,
            Inbound::Incomplete,
            Inbound::Dispatched(MessageId::new("big")),
        ]
    );
    assert_eq!(dispatched.recv().await.expect("dispatched").data(), payload);
    assert_eq!(receiver.buffered_fragments(), 0);
}

#[tokio::test]
async fn overflow_discards_offender_and_accepts_resend() {
    let config = GatewayConfig::builder()
        .max_buffered_fragments(2)
        .build()
        .expect("config");
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    let (session, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let held = session
        .receive_fragment(&wire_part("small", "note", 0, 2, "ab"))
        .await
        .expect("buffered");
    assert_eq!(held, Inbound::Incomplete);
    session
        .receive_fragment(&wire_part("big", "bulk", 0, 3, "xx"))
        .await
        .expect("buffered");

    let err = session
        .receive_fragment(&wire_part("big", "bulk", 1, 3, "yy"))
        .await
        .expect_err("ceiling crossed");
    assert!(matches!(
        err,
        InboundError::Reassembly(ReassemblyError::Overflow { ref identity, discarded: 2, .. })
            if identity.as_str() == "big"
    ));
    assert_eq!(session.buffered_fragments(), 1);
    assert!(!session.is_closed());
    assert!(written.drain().is_empty());

    let completed = session
        .receive_fragment(&wire_part("small", "note", 1, 2, "cd"))
        .await
        .expect("admitted");
    assert_eq!(completed, Inbound::Dispatched(MessageId::new("small")));
    assert_eq!(dispatched.recv().await.expect("dispatched").data(), "abcd");

    for (index, part) in [(2, "zz"), (0, "xx"), (1, "yy")] {
        let outcome = session
            .receive_fragment(&wire_part("big", "bulk", index, 3, part))
            .await
            .expect("resend admitted");
        if index == 1 {
            assert_eq!(outcome, Inbound::Dispatched(MessageId::new("big")));
        }
    }
    assert_eq!(dispatched.recv().await.expect("dispatched").data(), "xxyyzz");
    assert!(written.drain().is_empty());
}

#[rstest]
#[tokio::test]
async fn fragments_are_written_in_enqueue_order(config: GatewayConfig) {
    let config = GatewayConfig {
        max_fragment_size: std::num::NonZeroUsize::new(2).expect("non-zero"),
        ..config
    };
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, _transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    for (id, data) in [("m1", "abcd"), ("m2", "efgh")] {
        session
            .send_reply(LogicalMessage::new("push", data).with_id(id))
            .await
            .expect("queued");
    }

    let order: Vec<_> = written
        .drain()
        .into_iter()
        .map(|f| (f.identity().to_string(), f.payload().to_owned()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("m1".to_owned(), "ab".to_owned()),
            ("m1".to_owned(), "cd".to_owned()),
            ("m2".to_owned(), "ef".to_owned()),
            ("m2".to_owned(), "gh".to_owned()),
        ]
    );
}

#[rstest]
#[traced_test]
#[tokio::test]
async fn failed_write_drops_fragment(config: GatewayConfig) {
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    transport.set_failing(true);
    session
        .send_reply(LogicalMessage::new("push", "lost").with_id("p1"))
        .await
        .expect("queued");
    assert_eq!(session.queued_fragments(), 0);
    assert!(logs_contain("write failed; fragment dropped"));

    transport.set_failing(false);
    session
        .send_reply(LogicalMessage::new("push", "kept").with_id("p2"))
        .await
        .expect("queued");
    let fragments = written.drain();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].payload(), "kept");
}

#[rstest]
#[tokio::test]
async fn ping_reports_liveness(config: GatewayConfig) {
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, transport, mut written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    assert!(session.ping().await);
    assert_eq!(written.next_fragment().await.command(), PING_COMMAND);

    transport.set_failing(true);
    assert!(!session.ping().await);

    transport.set_failing(false);
    session.close().await;
    assert!(!session.ping().await);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out(config: GatewayConfig) {
    let config = GatewayConfig {
        request_timeout: Some(Duration::from_millis(250)),
        ..config
    };
    let (dispatcher, _dispatched) = RecordingDispatcher::new();
    let (session, _transport, _written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let outcome = session
        .send_request(LogicalMessage::new("query", "{}").with_id("slow"))
        .await;

    assert_eq!(outcome, Err(RequestError::TimedOut(MessageId::new("slow"))));
    assert_eq!(session.pending_requests(), 0);
}

#[rstest]
#[tokio::test]
async fn serve_closes_session_when_stream_ends(config: GatewayConfig) {
    let (dispatcher, mut dispatched) = RecordingDispatcher::new();
    let (session, transport, _written) =
        session_with(config, dispatcher, Arc::new(MemoryBroker::new()));

    let inbound = futures::stream::iter(vec![
        Ok(wire("s1", None, "query", "first")),
        Err(std::io::Error::other("reset")),
        Ok(wire("s2", None, "query", "second")),
    ]);
    Arc::clone(&session).serve(inbound).await;

    assert!(session.is_closed());
    assert!(transport.is_closed());
    let mut seen = vec![
        dispatched.recv().await.expect("first").data().to_owned(),
        dispatched.recv().await.expect("second").data().to_owned(),
    ];
    seen.sort();
    assert_eq!(seen, vec!["first", "second"]);
}
