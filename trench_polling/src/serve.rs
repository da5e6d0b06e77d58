//! HTTP handlers: GET flushes the outbound queue, POST feeds the inbound.

use bytes::Bytes;
use http::{header, Method, Response, StatusCode};
use http_body_util::Full;

use trench_core::request::text_response;
use trench_core::{payload, HttpRequest, Packet};

use crate::conn::{PollingConn, State};

pub(crate) async fn handle(conn: &PollingConn, req: HttpRequest) -> Response<Full<Bytes>> {
    if *req.method() == Method::GET {
        serve_get(conn, &req).await
    } else if *req.method() == Method::POST {
        serve_post(conn, &req)
    } else {
        text_response(StatusCode::BAD_REQUEST, "invalid method")
    }
}

/// Long-poll: block until packets are ready, then flush them all as one
/// payload body.
async fn serve_get(conn: &PollingConn, req: &HttpRequest) -> Response<Full<Bytes>> {
    // `b64=1` means the client cannot handle a binary response body.
    let binary_ok = req.query_param("b64").is_none();
    let _in_flight = conn.track();

    match conn.state() {
        State::Closed => return text_response(StatusCode::BAD_REQUEST, "transport closed"),
        State::Pausing | State::Paused => return flush_or_noop(conn, binary_ok),
        State::Normal => {}
    }

    let Some(_token) = conn.try_poll_token() else {
        return text_response(StatusCode::BAD_REQUEST, "overlap get");
    };

    let mut changed = conn.subscribe();
    loop {
        match conn.state() {
            State::Closed => {
                return text_response(StatusCode::BAD_REQUEST, "transport closed")
            }
            // An upgrade started while we were waiting: flush whatever is
            // queued so nothing is stranded on this conn, or keep the
            // client's poll loop alive with a NOOP.
            State::Pausing | State::Paused => return flush_or_noop(conn, binary_ok),
            State::Normal => {}
        }

        let packets = conn.drain_outbound();
        if !packets.is_empty() {
            return payload_response(&packets, binary_ok);
        }

        let deadline = conn.write_deadline();
        tokio::select! {
            () = conn.wait_signal() => {}
            () = tokio::time::sleep_until(deadline) => {
                // Nothing arrived within the poll window; an empty payload
                // lets the client re-poll.
                return payload_response(&[], binary_ok);
            }
            _ = changed.changed() => {}
        }
    }
}

/// Decode the client payload and enqueue every packet inbound.
fn serve_post(conn: &PollingConn, req: &HttpRequest) -> Response<Full<Bytes>> {
    let _in_flight = conn.track();

    match conn.state() {
        State::Closed => return text_response(StatusCode::BAD_REQUEST, "transport closed"),
        State::Pausing | State::Paused => {
            return text_response(StatusCode::BAD_REQUEST, "transport paused")
        }
        State::Normal => {}
    }

    let packets = match payload::decode(req.body()) {
        Ok(packets) => packets,
        Err(err) => {
            tracing::warn!(peer = %req.remote_addr(), %err, "malformed payload, closing conn");
            conn.shutdown();
            return text_response(StatusCode::BAD_REQUEST, "invalid payload");
        }
    };

    for packet in packets {
        if conn.feed(packet).is_err() {
            return text_response(StatusCode::BAD_REQUEST, "transport closed");
        }
    }

    text_response(StatusCode::OK, "ok")
}

fn flush_or_noop(conn: &PollingConn, binary_ok: bool) -> Response<Full<Bytes>> {
    let mut packets = conn.drain_outbound();
    if packets.is_empty() {
        packets.push(Packet::noop());
    }
    payload_response(&packets, binary_ok)
}

fn payload_response(packets: &[Packet], binary_ok: bool) -> Response<Full<Bytes>> {
    let binary = binary_ok && packets.iter().any(Packet::is_binary);
    let (body, content_type) = if binary {
        (payload::encode_binary(packets), "application/octet-stream")
    } else {
        (payload::encode_text(packets), "text/plain; charset=UTF-8")
    };
    let mut resp = Response::new(Full::new(body));
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(content_type),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Uri};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tokio::time::Instant;
    use trench_core::{Conn, PacketType, TransportError};

    fn conn() -> PollingConn {
        PollingConn::new(
            "/engine.io/?transport=polling".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
            HeaderMap::new(),
        )
    }

    fn request(method: Method, uri: &str, body: &[u8]) -> HttpRequest {
        HttpRequest::new(
            method,
            uri.parse::<Uri>().unwrap(),
            HeaderMap::new(),
            body.to_vec(),
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    async fn body_bytes(resp: Response<Full<Bytes>>) -> Bytes {
        resp.into_body().collect().await.unwrap().to_bytes()
    }

    fn message(data: &str) -> Packet {
        Packet::text(PacketType::Message, data.to_owned())
    }

    #[tokio::test]
    async fn get_flushes_queued_packets_as_text_payload() {
        let conn = conn();
        conn.send(message("hello")).await.unwrap();

        let resp = handle(&conn, request(Method::GET, "/engine.io/?transport=polling", b"")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/plain; charset=UTF-8"
        );
        assert_eq!(&body_bytes(resp).await[..], b"6:4hello");
    }

    #[tokio::test]
    async fn get_blocks_until_a_packet_is_sent() {
        let conn = conn();
        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move {
                handle(&conn, request(Method::GET, "/engine.io/?transport=polling", b"")).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        conn.send(message("now")).await.unwrap();
        let resp = pending.await.unwrap();
        assert_eq!(&body_bytes(resp).await[..], b"4:4now");
    }

    #[tokio::test]
    async fn concurrent_gets_are_refused() {
        let conn = conn();
        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move {
                handle(&conn, request(Method::GET, "/engine.io/?transport=polling", b"")).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let resp =
            handle(&conn, request(Method::GET, "/engine.io/?transport=polling", b"")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(&body_bytes(resp).await[..], b"overlap get");

        conn.send(message("done")).await.unwrap();
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn get_returns_an_empty_payload_at_the_write_deadline() {
        let conn = conn();
        conn.set_write_deadline(Instant::now() + Duration::from_millis(30));
        let resp = handle(&conn, request(Method::GET, "/engine.io/?transport=polling", b"")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_bytes(resp).await.is_empty());
    }

    #[tokio::test]
    async fn post_feeds_the_inbound_queue() {
        let conn = conn();
        let resp = handle(
            &conn,
            request(Method::POST, "/engine.io/?transport=polling", b"6:4hello1:2"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(&body_bytes(resp).await[..], b"ok");

        assert_eq!(conn.recv().await.unwrap(), message("hello"));
        assert_eq!(
            conn.recv().await.unwrap(),
            Packet::text(PacketType::Ping, "")
        );
    }

    #[tokio::test]
    async fn malformed_post_closes_the_conn() {
        let conn = conn();
        let resp = handle(
            &conn,
            request(Method::POST, "/engine.io/?transport=polling", b"not a payload"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(matches!(conn.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn binary_batches_use_binary_framing_unless_b64_forced() {
        let conn = conn();
        conn.send(Packet::binary(PacketType::Message, vec![1u8, 2]))
            .await
            .unwrap();
        let resp = handle(&conn, request(Method::GET, "/engine.io/?transport=polling", b"")).await;
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        assert_eq!(&body_bytes(resp).await[..], &[0x01, 3, 0xFF, b'4', 1, 2]);

        conn.send(Packet::binary(PacketType::Message, vec![1u8, 2]))
            .await
            .unwrap();
        let resp = handle(
            &conn,
            request(Method::GET, "/engine.io/?transport=polling&b64=1", b""),
        )
        .await;
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/plain; charset=UTF-8"
        );
        assert_eq!(&body_bytes(resp).await[..], b"6:b4AQI=");
    }

    #[tokio::test]
    async fn paused_conn_answers_gets_with_noop() {
        use trench_core::Pausable;

        let conn = conn();
        conn.pause().await.unwrap();
        let resp = handle(&conn, request(Method::GET, "/engine.io/?transport=polling", b"")).await;
        assert_eq!(&body_bytes(resp).await[..], b"1:6");

        let resp = handle(
            &conn,
            request(Method::POST, "/engine.io/?transport=polling", b"6:4hello"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pause_flushes_packets_queued_before_it() {
        use trench_core::Pausable;

        let conn = conn();
        conn.send(message("first")).await.unwrap();
        conn.send(message("second")).await.unwrap();

        let pause = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.pause().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The queue is non-empty, so the pause cannot have completed.
        assert!(!pause.is_finished());

        // The client's next poll picks the stranded packets up.
        let resp = handle(&conn, request(Method::GET, "/engine.io/?transport=polling", b"")).await;
        assert_eq!(&body_bytes(resp).await[..], b"6:4first7:4second");

        pause.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let conn = conn();
        let resp = handle(
            &conn,
            request(Method::PUT, "/engine.io/?transport=polling", b""),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
