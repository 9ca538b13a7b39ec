use crate::common::{start_server, TestClient};

#[tokio::test]
async fn should_accept_login() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.request(b"LOGIN foo none \n").await.code, 200);
    server.stop().await;
}

#[tokio::test]
async fn should_accept_login_without_credential() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.request(b"LOGIN foo none\n").await.code, 200);
    server.stop().await;
}

#[tokio::test]
async fn should_accept_login_with_binary_credential() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.request(b"LOGIN foo secret \x00\x04creds\n").await.code, 200);
    server.stop().await;
}

#[tokio::test]
async fn should_reject_login() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.request(b"LOGIN reject none \n").await.code, 401);
    server.stop().await;
}

#[tokio::test]
async fn should_reject_malformed_login() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::connect(addr).await;
    assert_eq!(client.request(b"HELLO foo none \n").await.code, 400);
    client.expect_closed().await;
    server.stop().await;
}

#[tokio::test]
async fn should_reject_relogin() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"LOGIN foo none \n").await.code, 405);
    client.expect_closed().await;
    server.stop().await;
}

#[tokio::test]
async fn should_fail_ucast_to_invalid() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"UCAST !@#$%^&* hello\n").await.code, 400);
    server.stop().await;
}

#[tokio::test]
async fn should_fail_ucast_to_non_existent() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"UCAST bar hello\n").await.code, 404);
    server.stop().await;
}

#[tokio::test]
async fn should_unicast_self() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"UCAST foo hello\n").await.code, 200);
    client.expect_event(b"UCAST", "foo", "foo", b"hello").await;
    server.stop().await;
}

#[tokio::test]
async fn should_unicast_self_binary() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"UCAST foo \x00\x04hello\n").await.code, 200);
    client.expect_event(b"UCAST", "foo", "foo", b"hello").await;
    server.stop().await;
}

#[tokio::test]
async fn should_reject_unicast_binary_short() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    // header announces 4 payload bytes but 5 precede the terminator
    assert_eq!(client.request(b"UCAST foo \x00\x03hello\n").await.code, 400);
    client.expect_closed().await;
    server.stop().await;
}

#[tokio::test]
async fn should_unicast_other() {
    let (server, addr) = start_server().await;
    let mut foo = TestClient::login(addr, "foo").await;
    let mut bar = TestClient::login(addr, "bar").await;

    assert_eq!(foo.request(b"UCAST bar hello\n").await.code, 200);
    bar.expect_event(b"UCAST", "foo", "bar", b"hello").await;

    assert_eq!(bar.request(b"UCAST foo world\n").await.code, 200);
    foo.expect_event(b"UCAST", "bar", "foo", b"world").await;
    server.stop().await;
}

#[tokio::test]
async fn should_answer_ping_with_pong_event() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    client.send(b"PING\n").await;
    client.expect_event(b"PONG", ".", "", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn should_swallow_pong() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    client.send(b"PONG\n").await;
    // the connection is still alive and PONG produced no output
    client.send(b"PING\n").await;
    client.expect_event(b"PONG", ".", "", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn should_close_on_request() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"CLOSE\n").await.code, 200);
    client.expect_closed().await;
    server.stop().await;
}

#[tokio::test]
async fn should_not_implement_unknown_verbs() {
    let (server, addr) = start_server().await;
    let mut client = TestClient::login(addr, "foo").await;
    assert_eq!(client.request(b"FROBNICATE target payload\n").await.code, 501);
    // unknown verbs do not kill the connection
    client.send(b"PING\n").await;
    client.expect_event(b"PONG", ".", "", b"").await;
    server.stop().await;
}

#[tokio::test]
async fn anonymous_may_unicast_but_not_subscribe() {
    let (server, addr) = start_server().await;
    let mut anon = TestClient::login(addr, ".").await;
    let mut foo = TestClient::login(addr, "foo").await;

    assert_eq!(anon.request(b"SUBSCRIBE chat\n").await.code, 405);
    assert_eq!(anon.request(b"UNSUBSCRIBE chat\n").await.code, 405);
    assert_eq!(anon.request(b"BCAST hello\n").await.code, 405);

    assert_eq!(anon.request(b"UCAST foo hello\n").await.code, 200);
    foo.expect_event(b"UCAST", ".", "foo", b"hello").await;
    server.stop().await;
}

#[tokio::test]
async fn newer_login_displaces_older() {
    let (server, addr) = start_server().await;
    let mut first = TestClient::login(addr, "foo").await;
    let mut second = TestClient::login(addr, "foo").await;

    // the displaced connection is closed; the name now routes to the winner
    first.expect_closed().await;
    assert_eq!(second.request(b"UCAST foo hello\n").await.code, 200);
    second.expect_event(b"UCAST", "foo", "foo", b"hello").await;
    server.stop().await;
}
