//! Per-message dispatch and the join state machine.
//!
//! Join requests from malformed or incompatible clients get a silent
//! deferred disconnect instead of an error frame; such a peer cannot be
//! trusted to handle one. Every other failure is answered with an error
//! payload scoped to the request.

use crate::error::SyncError;
use crate::gateway::events::{decode_bytes, encode_bytes, ClientRequest, OutboundEvent};
use crate::gateway::rooms::{RoomKind, SpaceAction, SpaceType, TopicKey};
use crate::gateway::version::{self, ProtocolRoom};
use crate::AppState;

/// What the connection loop should do after a request.
#[derive(Debug)]
pub enum Outcome {
    Reply(OutboundEvent),
    /// Request handled; nothing to send.
    Done,
    /// Close the connection after one scheduling tick, without an error
    /// frame.
    Disconnect,
}

pub async fn handle_request(state: &AppState, conn_id: &str, request: ClientRequest) -> Outcome {
    match request {
        ClientRequest::JoinSpace {
            space_type,
            space_id,
            client_version,
        } => join_space(state, conn_id, &space_type, &space_id, &client_version).await,
        ClientRequest::LeaveSpace {
            space_type,
            space_id,
        } => reply(leave_space(state, conn_id, &space_type, &space_id)),
        ClientRequest::LoadDoc {
            space_type,
            space_id,
            doc_id,
            state_vector,
        } => reply(load_doc(state, conn_id, &space_type, &space_id, &doc_id, state_vector).await),
        ClientRequest::DeleteDoc {
            space_type,
            space_id,
            doc_id,
        } => reply(delete_doc(state, conn_id, &space_type, &space_id, &doc_id).await),
        ClientRequest::PushDocUpdate {
            space_type,
            space_id,
            doc_id,
            update,
        } => reply(push_doc_update(state, conn_id, &space_type, &space_id, &doc_id, &update).await),
        ClientRequest::LoadDocTimestamps {
            space_type,
            space_id,
            timestamp,
        } => reply(load_doc_timestamps(state, conn_id, &space_type, &space_id, timestamp).await),
        ClientRequest::JoinAwareness {
            space_type,
            space_id,
            doc_id,
        } => reply(join_awareness(state, conn_id, &space_type, &space_id, &doc_id).await),
        ClientRequest::LeaveAwareness {
            space_type,
            space_id,
            doc_id,
        } => reply(leave_awareness(state, conn_id, &space_type, &space_id, &doc_id)),
        ClientRequest::LoadAwarenesses {
            space_type,
            space_id,
            doc_id,
        } => reply(load_awarenesses(state, conn_id, &space_type, &space_id, &doc_id)),
        ClientRequest::UpdateAwareness {
            space_type,
            space_id,
            doc_id,
            awareness_update,
        } => reply(update_awareness(
            state,
            conn_id,
            &space_type,
            &space_id,
            &doc_id,
            &awareness_update,
        )),
    }
}

fn reply(result: Result<Option<OutboundEvent>, SyncError>) -> Outcome {
    match result {
        Ok(Some(event)) => Outcome::Reply(event),
        Ok(None) => Outcome::Done,
        Err(err) if err.is_silent() => Outcome::Disconnect,
        Err(err) => Outcome::Reply(OutboundEvent::error(&err)),
    }
}

/// Join state machine. Any validation or authorization failure here is a
/// silent disconnect.
async fn join_space(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    client_version: &str,
) -> Outcome {
    let Some(space_type) = SpaceType::parse(space_type) else {
        tracing::debug!(conn_id, space_type, "join with unknown space kind");
        return Outcome::Disconnect;
    };
    let Some(protocol) = version::negotiate(client_version) else {
        tracing::debug!(conn_id, client_version, "join from unsupported client");
        return Outcome::Disconnect;
    };
    let Some(user_id) = state.registry.user_of(conn_id) else {
        tracing::debug!(conn_id, "join without an attached user");
        return Outcome::Disconnect;
    };

    let adapter = state.adapters.for_space(space_type);
    let joined = state
        .membership
        .join(
            adapter,
            conn_id,
            &user_id,
            space_id,
            RoomKind::Sync,
            SpaceAction::Read,
        )
        .await;
    if let Err(err) = joined {
        tracing::debug!(conn_id, space_id, %err, "join rejected");
        return Outcome::Disconnect;
    }

    // The only place a connection switches protocol rooms. Subscribing
    // evicts the sibling room, so a re-join with the same negotiated kind is
    // a no-op and a version change moves the connection over.
    let room = match protocol {
        ProtocolRoom::Legacy => RoomKind::SyncLegacy,
        ProtocolRoom::Current => RoomKind::SyncCurrent,
    };
    state
        .registry
        .subscribe(conn_id, TopicKey::new(space_type, space_id, room));

    tracing::debug!(conn_id, space_id, ?protocol, "joined space");
    Outcome::Reply(OutboundEvent::JoinAck {
        connection_id: conn_id.to_string(),
        success: true,
    })
}

fn leave_space(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    state.registry.unsubscribe_space(conn_id, space_type, space_id);
    Ok(None)
}

async fn load_doc(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    doc_id: &str,
    state_vector: Option<String>,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    assert_in_sync(state, conn_id, space_type, space_id)?;

    let state_vector = match state_vector {
        Some(encoded) => Some(decode_bytes(&encoded)?),
        None => None,
    };
    let diff = state
        .doc_store(space_type)
        .get_doc_diff(space_id, doc_id, state_vector.as_deref())
        .await?
        .ok_or_else(|| SyncError::DocNotFound {
            doc_id: doc_id.to_string(),
        })?;

    Ok(Some(OutboundEvent::DocState {
        doc_id: doc_id.to_string(),
        missing: false,
        state: Some(encode_bytes(&diff.state)),
        timestamp: Some(diff.timestamp),
    }))
}

async fn delete_doc(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    doc_id: &str,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    assert_in_sync(state, conn_id, space_type, space_id)?;

    state.doc_store(space_type).delete_doc(space_id, doc_id).await?;
    Ok(Some(OutboundEvent::DocDeleted {
        doc_id: doc_id.to_string(),
        success: true,
    }))
}

async fn push_doc_update(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    doc_id: &str,
    update: &str,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    let update = decode_bytes(update)?;
    let editor = state
        .registry
        .user_of(conn_id)
        .unwrap_or_else(|| conn_id.to_string());

    let timestamp = state
        .broadcaster
        .push(
            state.doc_store(space_type),
            conn_id,
            space_type,
            space_id,
            doc_id,
            vec![update],
            &editor,
        )
        .await?;

    Ok(Some(OutboundEvent::UpdateAck {
        doc_id: doc_id.to_string(),
        accepted: true,
        timestamp,
    }))
}

async fn load_doc_timestamps(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    after: Option<i64>,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    assert_in_sync(state, conn_id, space_type, space_id)?;

    let timestamps = state
        .doc_store(space_type)
        .get_space_doc_timestamps(space_id, after)
        .await?;
    Ok(Some(OutboundEvent::DocTimestamps { timestamps }))
}

async fn join_awareness(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    doc_id: &str,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    let user_id = state.registry.user_of(conn_id).ok_or(SyncError::AccessDenied {
        space_id: space_id.to_string(),
    })?;

    let adapter = state.adapters.for_space(space_type);
    state
        .awareness
        .join(adapter, conn_id, &user_id, space_id, doc_id)
        .await?;
    Ok(None)
}

fn leave_awareness(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    doc_id: &str,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    let adapter = state.adapters.for_space(space_type);
    state.awareness.leave(adapter, conn_id, space_id, doc_id);
    Ok(None)
}

fn load_awarenesses(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    doc_id: &str,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    let adapter = state.adapters.for_space(space_type);
    state.awareness.collect(adapter, conn_id, space_id, doc_id)?;
    Ok(None)
}

fn update_awareness(
    state: &AppState,
    conn_id: &str,
    space_type: &str,
    space_id: &str,
    doc_id: &str,
    awareness_update: &str,
) -> Result<Option<OutboundEvent>, SyncError> {
    let space_type = parse_space(space_type)?;
    let adapter = state.adapters.for_space(space_type);
    state
        .awareness
        .update(adapter, conn_id, space_id, doc_id, awareness_update)?;
    Ok(None)
}

fn parse_space(raw: &str) -> Result<SpaceType, SyncError> {
    SpaceType::parse(raw).ok_or_else(|| SyncError::bad_request(format!("unknown space kind {raw:?}")))
}

fn assert_in_sync(
    state: &AppState,
    conn_id: &str,
    space_type: SpaceType,
    space_id: &str,
) -> Result<(), SyncError> {
    let topic = TopicKey::new(space_type, space_id, RoomKind::Sync);
    state.membership.assert_in(conn_id, &topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::sync::mpsc;

    fn state_with_conn(conn_id: &str, user_id: Option<&str>) -> (AppState, mpsc::UnboundedReceiver<OutboundEvent>) {
        let state = AppState::in_memory(Config::default());
        let (tx, rx) = mpsc::unbounded_channel();
        state.registry.register(conn_id.to_string(), tx);
        if let Some(user_id) = user_id {
            state.registry.attach_user(conn_id, user_id);
        }
        (state, rx)
    }

    async fn join(state: &AppState, conn_id: &str, space_id: &str, client_version: &str) -> Outcome {
        handle_request(
            state,
            conn_id,
            ClientRequest::JoinSpace {
                space_type: "workspace".to_string(),
                space_id: space_id.to_string(),
                client_version: client_version.to_string(),
            },
        )
        .await
    }

    fn assert_join_ack(outcome: Outcome) {
        match outcome {
            Outcome::Reply(OutboundEvent::JoinAck { success: true, .. }) => {}
            other => panic!("expected join ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_acks_and_subscribes_protocol_room() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);

        let base = TopicKey::new(SpaceType::Workspace, "w1", RoomKind::Sync);
        let current = TopicKey::new(SpaceType::Workspace, "w1", RoomKind::SyncCurrent);
        assert!(state.registry.is_member("c1", &base));
        assert!(state.registry.is_member("c1", &current));
    }

    #[tokio::test]
    async fn legacy_client_lands_in_legacy_room() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.25.0").await);

        let legacy = TopicKey::new(SpaceType::Workspace, "w1", RoomKind::SyncLegacy);
        assert!(state.registry.is_member("c1", &legacy));
    }

    #[tokio::test]
    async fn rejoin_with_new_version_switches_rooms() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.25.0").await);
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);

        let legacy = TopicKey::new(SpaceType::Workspace, "w1", RoomKind::SyncLegacy);
        let current = TopicKey::new(SpaceType::Workspace, "w1", RoomKind::SyncCurrent);
        assert!(!state.registry.is_member("c1", &legacy));
        assert!(state.registry.is_member("c1", &current));
    }

    #[tokio::test]
    async fn rejoin_same_version_is_a_no_op() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);

        let current = TopicKey::new(SpaceType::Workspace, "w1", RoomKind::SyncCurrent);
        assert!(state.registry.is_member("c1", &current));
    }

    #[tokio::test]
    async fn unsupported_version_disconnects_silently() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert!(matches!(
            join(&state, "c1", "w1", "0.19.0").await,
            Outcome::Disconnect
        ));
    }

    #[tokio::test]
    async fn unknown_space_kind_disconnects_silently() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::JoinSpace {
                space_type: "blackhole".to_string(),
                space_id: "w1".to_string(),
                client_version: "0.26.1".to_string(),
            },
        )
        .await;
        assert!(matches!(outcome, Outcome::Disconnect));
    }

    #[tokio::test]
    async fn join_without_user_disconnects_silently() {
        let (state, _rx) = state_with_conn("c1", None);
        assert!(matches!(
            join(&state, "c1", "w1", "0.26.1").await,
            Outcome::Disconnect
        ));
    }

    #[tokio::test]
    async fn userspace_join_of_foreign_space_disconnects() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::JoinSpace {
                space_type: "userspace".to_string(),
                space_id: "someone-else".to_string(),
                client_version: "0.26.1".to_string(),
            },
        )
        .await;
        assert!(matches!(outcome, Outcome::Disconnect));
    }

    #[tokio::test]
    async fn push_without_join_returns_not_in_space() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::PushDocUpdate {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
                doc_id: "d1".to_string(),
                update: encode_bytes(&[1]),
            },
        )
        .await;
        match outcome {
            Outcome::Reply(OutboundEvent::Error { code, .. }) => {
                assert_eq!(code, "not-in-space");
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_after_join_acks_with_timestamp() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);

        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::PushDocUpdate {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
                doc_id: "d1".to_string(),
                update: encode_bytes(&[1, 2]),
            },
        )
        .await;
        match outcome {
            Outcome::Reply(OutboundEvent::UpdateAck {
                accepted, timestamp, ..
            }) => {
                assert!(accepted);
                assert_eq!(timestamp, 1);
            }
            other => panic!("expected update ack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_doc_round_trips_pushed_state() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);

        handle_request(
            &state,
            "c1",
            ClientRequest::PushDocUpdate {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
                doc_id: "d1".to_string(),
                update: encode_bytes(&[7, 7]),
            },
        )
        .await;

        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::LoadDoc {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
                doc_id: "d1".to_string(),
                state_vector: None,
            },
        )
        .await;
        match outcome {
            Outcome::Reply(OutboundEvent::DocState {
                missing,
                state: Some(doc_state),
                timestamp: Some(ts),
                ..
            }) => {
                assert!(!missing);
                assert_eq!(decode_bytes(&doc_state).unwrap(), vec![7, 7]);
                assert_eq!(ts, 1);
            }
            other => panic!("expected doc state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_missing_doc_is_an_explicit_error() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);

        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::LoadDoc {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
                doc_id: "ghost".to_string(),
                state_vector: None,
            },
        )
        .await;
        match outcome {
            Outcome::Reply(OutboundEvent::Error { code, .. }) => {
                assert_eq!(code, "doc-not-found");
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_space_drops_all_memberships() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);

        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::LeaveSpace {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
            },
        )
        .await;
        assert!(matches!(outcome, Outcome::Done));

        let base = TopicKey::new(SpaceType::Workspace, "w1", RoomKind::Sync);
        assert!(!state.registry.is_member("c1", &base));
    }

    #[tokio::test]
    async fn doc_timestamps_require_membership() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::LoadDocTimestamps {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
                timestamp: None,
            },
        )
        .await;
        match outcome {
            Outcome::Reply(OutboundEvent::Error { code, .. }) => {
                assert_eq!(code, "not-in-space");
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn awareness_update_relays_between_members() {
        let (state, _rx_a) = state_with_conn("a", Some("u1"));
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        state.registry.register("b".to_string(), tx_b);
        state.registry.attach_user("b", "u2");

        for conn in ["a", "b"] {
            let outcome = handle_request(
                &state,
                conn,
                ClientRequest::JoinAwareness {
                    space_type: "workspace".to_string(),
                    space_id: "w1".to_string(),
                    doc_id: "d1".to_string(),
                },
            )
            .await;
            assert!(matches!(outcome, Outcome::Done));
        }

        let outcome = handle_request(
            &state,
            "a",
            ClientRequest::UpdateAwareness {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
                doc_id: "d1".to_string(),
                awareness_update: "cursor".to_string(),
            },
        )
        .await;
        assert!(matches!(outcome, Outcome::Done));

        match rx_b.try_recv().unwrap() {
            OutboundEvent::AwarenessUpdate { awareness_update, .. } => {
                assert_eq!(awareness_update, "cursor");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_base64_update_is_a_bad_request() {
        let (state, _rx) = state_with_conn("c1", Some("u1"));
        assert_join_ack(join(&state, "c1", "w1", "0.26.1").await);

        let outcome = handle_request(
            &state,
            "c1",
            ClientRequest::PushDocUpdate {
                space_type: "workspace".to_string(),
                space_id: "w1".to_string(),
                doc_id: "d1".to_string(),
                update: "!!not-base64!!".to_string(),
            },
        )
        .await;
        match outcome {
            Outcome::Reply(OutboundEvent::Error { code, .. }) => {
                assert_eq!(code, "bad-request");
            }
            other => panic!("expected error reply, got {other:?}"),
        }
    }
}
