use crate::common::{start_server, TestClient};

#[tokio::test]
async fn should_multicast() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    assert_eq!(foo.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE chat\n").await.code, 200);

    assert_eq!(foo.request(b"MCAST chat hello\n").await.code, 200);
    bar.expect_event(b"MCAST", "foo", "chat", b"hello").await;

    assert_eq!(bar.request(b"MCAST chat world\n").await.code, 200);
    foo.expect_event(b"MCAST", "bar", "chat", b"world").await;
    server.stop().await;
}

#[tokio::test]
async fn multicast_to_absent_topic_is_ok() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"MCAST nowhere hello\n").await.code, 200);
    // nothing was routed anywhere; the connection keeps going
    client.send(b"PING\n").await;
    client.expect_event(b"PONG", ".", "", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn multicast_skips_the_sender() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    assert_eq!(foo.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(foo.request(b"MCAST chat hello\n").await.code, 200);

    // foo must not see its own MCAST; the next event it gets is a PONG
    foo.send(b"PING\n").await;
    foo.expect_event(b"PONG", ".", "", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn duplicate_subscribe_conflicts() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(client.request(b"SUBSCRIBE chat\n").await.code, 409);
    assert_eq!(client.request(b"SUBSCRIBE chat PRESENCE\n").await.code, 409);
    server.stop().await;
}

#[tokio::test]
async fn subscribe_rejects_unknown_option() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"SUBSCRIBE chat LOUDLY\n").await.code, 400);
    // a bad option is a semantic error, not a framing error
    client.send(b"PING\n").await;
    client.expect_event(b"PONG", ".", "", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn unsubscribe_requires_membership() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    assert_eq!(foo.request(b"UNSUBSCRIBE chat\n").await.code, 404);
    assert_eq!(bar.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(foo.request(b"UNSUBSCRIBE chat\n").await.code, 404);
    server.stop().await;
}

#[tokio::test]
async fn should_get_presence() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    assert_eq!(foo.request(b"SUBSCRIBE chat PRESENCE\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE chat PRESENCE\n").await.code, 200);

    // the live event for foo, the membership catch-up for bar
    foo.expect_event(b"SUBSCRIBE", "bar", "chat", b"PRESENCE").await;
    bar.expect_event(b"SUBSCRIBE", "foo", "chat", b"PRESENCE").await;

    assert_eq!(foo.request(b"UNSUBSCRIBE chat\n").await.code, 200);
    bar.expect_event(b"UNSUBSCRIBE", "foo", "chat", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn presence_catchup_reflects_member_flags() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    // foo did not opt in, so bar's catch-up entry for foo has no option
    assert_eq!(foo.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE chat PRESENCE\n").await.code, 200);
    bar.expect_event(b"SUBSCRIBE", "foo", "chat", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn subscriber_without_presence_sees_no_membership_events() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    assert_eq!(foo.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(bar.request(b"UNSUBSCRIBE chat\n").await.code, 200);

    // foo saw neither the join nor the leave
    foo.send(b"PING\n").await;
    foo.expect_event(b"PONG", ".", "", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn should_unsubscribe_on_close() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    assert_eq!(foo.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE chat PRESENCE\n").await.code, 200);
    bar.expect_event(b"SUBSCRIBE", "foo", "chat", b"").await;

    // foo drops its transport without an UNSUBSCRIBE
    drop(foo);
    bar.expect_event(b"UNSUBSCRIBE", "foo", "chat", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn should_notify_presence_on_close_request() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    assert_eq!(foo.request(b"SUBSCRIBE chat\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE chat PRESENCE\n").await.code, 200);
    bar.expect_event(b"SUBSCRIBE", "foo", "chat", b"").await;

    assert_eq!(foo.request(b"CLOSE\n").await.code, 200);
    bar.expect_event(b"UNSUBSCRIBE", "foo", "chat", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn should_broadcast_with_union_dedup() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;
    let mut baz = TestClient::login(addr, "baz").await;

    // three overlapping pair topics, every client in exactly two of them
    assert_eq!(foo.request(b"SUBSCRIBE foo:bar\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE foo:bar\n").await.code, 200);
    assert_eq!(foo.request(b"SUBSCRIBE foo:baz\n").await.code, 200);
    assert_eq!(baz.request(b"SUBSCRIBE foo:baz\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE bar:baz\n").await.code, 200);
    assert_eq!(baz.request(b"SUBSCRIBE bar:baz\n").await.code, 200);

    assert_eq!(foo.request(b"BCAST fool\n").await.code, 200);
    assert_eq!(bar.request(b"BCAST bart\n").await.code, 200);
    assert_eq!(baz.request(b"BCAST baza\n").await.code, 200);

    // every client gets exactly one BCAST from each other client, never
    // duplicated across the shared topics
    let expected: [(&mut TestClient, [(&[u8], &[u8]); 2]); 3] = [
        (&mut foo, [(b"bar", b"bart"), (b"baz", b"baza")]),
        (&mut bar, [(b"baz", b"baza"), (b"foo", b"fool")]),
        (&mut baz, [(b"bar", b"bart"), (b"foo", b"fool")]),
    ];
    for (client, expected) in expected {
        let mut got = vec![client.event().await, client.event().await];
        got.sort_by(|a, b| a.from.cmp(&b.from));
        for (ev, (from, payload)) in got.iter().zip(expected) {
            assert_eq!(ev.name, b"BCAST");
            assert_eq!(ev.from, from);
            assert_eq!(ev.payload, payload);
        }
        // and nothing else: the next event after the pair is our PONG
        client.send(b"PING\n").await;
        client.expect_event(b"PONG", ".", "", b"").await;
    }
    server.stop().await;
}

#[tokio::test]
async fn dump_stats_is_safe_during_traffic() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;
    assert_eq!(foo.request(b"SUBSCRIBE chat PRESENCE\n").await.code, 200);
    assert_eq!(bar.request(b"SUBSCRIBE chat\n").await.code, 200);

    for _ in 0..10 {
        assert_eq!(foo.request(b"MCAST chat hello\n").await.code, 200);
        let mut out = Vec::new();
        server.dump_stats(&mut out).unwrap();
        let dump = String::from_utf8(out).unwrap();
        assert!(dump.contains("named connections"));
        assert!(dump.contains("active topics"));
        bar.expect_event(b"MCAST", "foo", "chat", b"hello").await;
    }
    server.stop().await;
}
