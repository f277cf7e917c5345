use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{select, sync::mpsc};
use tracing::{debug, warn};

use crate::{
    hub::{ClientId, Departure, HubHandle, Payload, Publish, Registration},
    message::{DecodeError, Envelope, JOIN_TYPE, MessageBody, User},
};

/// Upgrade endpoint for `GET /chat/:channel`.
pub async fn chat_route(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    State(hub): State<HubHandle>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, channel, hub))
}

/// Bridges one WebSocket to the hub's event vocabulary: register on
/// upgrade, forward decoded frames, write back envelopes, and unregister
/// when the socket goes away.
async fn handle_socket(socket: WebSocket, channel: String, hub: HubHandle) {
    let client_id = hub.next_client_id();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    hub.register(Registration {
        id: client_id,
        channel: channel.clone(),
        outbound: outbound_tx,
    });
    debug!(client = client_id, channel = %channel, "connection upgraded");

    run_session(socket, client_id, &channel, &hub, outbound_rx).await;

    // The transport closing is the authoritative disconnect signal; there
    // is no explicit disconnect command.
    hub.unregister(Departure {
        id: client_id,
        channel,
    });
}

async fn run_session(
    socket: WebSocket,
    client_id: ClientId,
    channel: &str,
    hub: &HubHandle,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
) {
    let (mut sink, mut stream) = socket.split();
    let mut identity: Option<User> = None;

    loop {
        select! {
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    if !handle_frame(frame, client_id, channel, hub, &mut identity) {
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(client = client_id, channel = %channel, error = %err, "read failed");
                    break;
                }
                None => break,
            },
            envelope = outbound.recv() => match envelope {
                Some(envelope) => {
                    if !write_envelope(&mut sink, client_id, &envelope).await {
                        break;
                    }
                }
                // The hub dropped our queue; nothing more will arrive.
                None => break,
            },
        }
    }
}

/// Decodes one inbound frame and forwards it to the hub.
///
/// Returns `false` when the connection should wind down. A frame that
/// fails to decode is logged and dropped; one bad frame must not cost the
/// whole connection.
fn handle_frame(
    frame: Message,
    client_id: ClientId,
    channel: &str,
    hub: &HubHandle,
    identity: &mut Option<User>,
) -> bool {
    let payload = match frame {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        Message::Close(_) => return false,
        // Axum answers pings on its own; nothing to forward.
        Message::Ping(_) | Message::Pong(_) => return true,
    };

    match classify(&payload, identity) {
        Ok(decoded) => {
            hub.publish(Publish {
                sender: client_id,
                channel: channel.to_string(),
                payload: decoded,
            });
        }
        Err(err) => {
            warn!(client = client_id, channel = %channel, error = %err, "dropping frame");
        }
    }
    true
}

/// Turns raw bytes into a hub payload, fixing the connection identity on
/// the first join and stamping it onto everything else.
fn classify(payload: &[u8], identity: &mut Option<User>) -> Result<Payload, DecodeError> {
    let body = MessageBody::decode(payload)?;
    if body.kind == JOIN_TYPE {
        let user = body.join_user()?;
        // The first join after connect fixes the identity for the rest of
        // the connection; later joins keep the original.
        let user = identity.get_or_insert(user).clone();
        Ok(Payload::Join(user))
    } else {
        let user = identity.clone().ok_or(DecodeError::NoIdentity)?;
        Ok(Payload::Stamped(MessageBody {
            user: Some(user),
            ..body
        }))
    }
}

async fn write_envelope(
    sink: &mut SplitSink<WebSocket, Message>,
    client_id: ClientId,
    envelope: &Envelope,
) -> bool {
    let text = match envelope.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(client = client_id, error = %err, "failed to encode envelope");
            return true;
        }
    };
    if let Err(err) = sink.send(Message::Text(text)).await {
        debug!(client = client_id, error = %err, "write failed");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ann() -> User {
        User {
            id: 1,
            name: "Ann".into(),
        }
    }

    #[test]
    fn first_join_fixes_the_identity() {
        let mut identity = None;
        let payload = classify(
            br#"{"type":1,"content":{"id":1,"name":"Ann"}}"#,
            &mut identity,
        )
        .expect("join decodes");
        assert!(matches!(payload, Payload::Join(user) if user == ann()));
        assert_eq!(identity, Some(ann()));
    }

    #[test]
    fn later_joins_keep_the_original_identity() {
        let mut identity = Some(ann());
        let payload = classify(
            br#"{"type":1,"content":{"id":9,"name":"Impostor"}}"#,
            &mut identity,
        )
        .expect("join decodes");
        assert!(matches!(payload, Payload::Join(user) if user == ann()));
        assert_eq!(identity, Some(ann()));
    }

    #[test]
    fn chat_is_stamped_with_the_fixed_identity() {
        let mut identity = Some(ann());
        let payload = classify(br#"{"type":0,"content":{"body":"hi"}}"#, &mut identity)
            .expect("chat decodes");
        let body = match payload {
            Payload::Stamped(body) => body,
            other => panic!("chat should be stamped, not {other:?}"),
        };
        assert_eq!(body.kind, 0);
        assert_eq!(body.user, Some(ann()));
    }

    #[test]
    fn chat_before_any_join_is_rejected() {
        let mut identity = None;
        let result = classify(br#"{"type":0,"content":{"body":"hi"}}"#, &mut identity);
        assert!(matches!(result, Err(DecodeError::NoIdentity)));
    }

    #[test]
    fn join_missing_fields_does_not_fix_identity() {
        let mut identity = None;
        let result = classify(br#"{"type":1,"content":{"id":1}}"#, &mut identity);
        assert!(matches!(result, Err(DecodeError::MissingField("name"))));
        assert_eq!(identity, None);
    }

    #[test]
    fn unknown_discriminants_are_relayed_stamped() {
        let mut identity = Some(ann());
        let payload = classify(br#"{"type":7,"content":{"sdp":"offer"}}"#, &mut identity)
            .expect("relay frame decodes");
        let body = match payload {
            Payload::Stamped(body) => body,
            other => panic!("relay frame should be stamped, not {other:?}"),
        };
        assert_eq!(body.kind, 7);
        assert_eq!(body.user, Some(ann()));
    }
}
