use std::sync::atomic::Ordering;

use shared::{
    domain::{MessageId, Role},
    error::{ApiError, ErrorCode},
    protocol::ServerEvent,
};

use super::support::*;
use crate::{ClientEvent, LogoutReason, SessionPhase};

fn drain(events: &mut tokio::sync::broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn online_and_offline_track_the_set() {
    let harness = Harness::connected().await;
    let mut events = harness.engine.subscribe_events();

    harness
        .engine
        .dispatch(ServerEvent::UserOnline {
            user: user(CAROL, "carol"),
        })
        .await;
    harness
        .engine
        .dispatch(ServerEvent::UserOffline { user_id: BOB })
        .await;

    let online: Vec<_> = harness
        .snapshot()
        .await
        .presence
        .online
        .into_keys()
        .collect();
    assert_eq!(online, vec![ME, CAROL]);
    assert_eq!(
        drain(&mut events),
        vec![ClientEvent::PresenceChanged, ClientEvent::PresenceChanged]
    );

    harness
        .engine
        .dispatch(ServerEvent::UserOffline { user_id: BOB })
        .await;
    assert!(drain(&mut events).is_empty(), "unknown user going offline is a no-op");
}

#[tokio::test]
async fn avatar_token_busts_the_cache_and_survives_reconnecting_user() {
    let harness = Harness::connected().await;

    harness
        .engine
        .dispatch(ServerEvent::UserAvatarUpdated {
            user_id: BOB,
            avatar_token: Some("abc".into()),
            removed: false,
        })
        .await;
    let expected = "http://fake/users/2/avatar?v=abc".to_string();
    let presence = harness.snapshot().await.presence;
    assert_eq!(presence.avatars.get(&BOB), Some(&expected));
    assert_eq!(presence.online[&BOB].avatar_url, Some(expected.clone()));

    harness
        .engine
        .dispatch(ServerEvent::UserOffline { user_id: BOB })
        .await;
    harness
        .engine
        .dispatch(ServerEvent::UserOnline {
            user: user(BOB, "bob"),
        })
        .await;
    let presence = harness.snapshot().await.presence;
    assert_eq!(presence.online[&BOB].avatar_url, Some(expected));

    harness
        .engine
        .dispatch(ServerEvent::UserAvatarUpdated {
            user_id: BOB,
            avatar_token: None,
            removed: true,
        })
        .await;
    let presence = harness.snapshot().await.presence;
    assert!(presence.avatars.get(&BOB).is_none());
    assert!(presence.online[&BOB].avatar_url.is_none());
}

#[tokio::test]
async fn own_avatar_update_without_token_gets_fresh_one() {
    let harness = Harness::connected().await;
    let update = ServerEvent::UserAvatarUpdated {
        user_id: ME,
        avatar_token: None,
        removed: false,
    };

    harness.engine.dispatch(update.clone()).await;
    let first = harness.snapshot().await.me.and_then(|me| me.avatar_url);
    harness.engine.dispatch(update).await;
    let second = harness.snapshot().await.me.and_then(|me| me.avatar_url);

    let first = first.expect("avatar set");
    let token = first
        .strip_prefix("http://fake/users/1/avatar?v=")
        .expect("versioned url");
    assert_eq!(token.len(), 32);
    assert_ne!(Some(first), second);
}

#[tokio::test]
async fn profile_update_fans_out_to_every_view_of_the_user() {
    let harness = Harness::connected().await;
    harness
        .engine
        .dispatch(ServerEvent::VoiceUserJoined {
            participant: participant(BOB, LOUNGE),
        })
        .await;

    harness
        .engine
        .dispatch(ServerEvent::UserProfileUpdated {
            user_id: BOB,
            username: "robert".into(),
            display_name: Some("Rob".into()),
        })
        .await;

    let snapshot = harness.snapshot().await;
    let bob = &snapshot.presence.online[&BOB];
    assert_eq!(bob.username, "robert");
    assert_eq!(bob.shown_name(), "Rob");
    assert_eq!(snapshot.voice.participants[&(BOB, LOUNGE)].username, "robert");
    for message in &snapshot.channel.messages {
        assert_eq!(message.author_username, "robert");
        assert_eq!(message.author_display_name.as_deref(), Some("Rob"));
    }
}

#[tokio::test]
async fn rename_keeps_existing_display_name() {
    let harness = Harness::connected().await;
    harness
        .engine
        .dispatch(ServerEvent::UserProfileUpdated {
            user_id: BOB,
            username: "bob".into(),
            display_name: Some("Bobby".into()),
        })
        .await;

    harness
        .engine
        .dispatch(ServerEvent::UserRenamed {
            user_id: BOB,
            username: "bob2".into(),
        })
        .await;

    let snapshot = harness.snapshot().await;
    let bob = &snapshot.presence.online[&BOB];
    assert_eq!(bob.username, "bob2");
    assert_eq!(bob.display_name.as_deref(), Some("Bobby"));
    assert_eq!(snapshot.channel.messages[0].author_username, "bob2");
    assert_eq!(
        snapshot.channel.messages[0].author_display_name.as_deref(),
        Some("Bobby")
    );
}

#[tokio::test]
async fn profile_update_can_clear_display_name() {
    let harness = Harness::connected().await;
    for display_name in [Some("Bobby".to_string()), None] {
        harness
            .engine
            .dispatch(ServerEvent::UserProfileUpdated {
                user_id: BOB,
                username: "bob".into(),
                display_name,
            })
            .await;
    }
    let snapshot = harness.snapshot().await;
    assert!(snapshot.presence.online[&BOB].display_name.is_none());
}

#[tokio::test]
async fn local_role_change_updates_me() {
    let harness = Harness::connected().await;
    harness
        .engine
        .dispatch(ServerEvent::UserRoleChanged {
            user_id: ME,
            role: Role::Mod,
        })
        .await;
    harness
        .engine
        .dispatch(ServerEvent::UserRoleChanged {
            user_id: CAROL,
            role: Role::Owner,
        })
        .await;

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.me.map(|me| me.role), Some(Role::Mod));
    assert_eq!(snapshot.presence.roles.get(&ME), Some(&Role::Mod));
    assert_eq!(snapshot.presence.roles.get(&CAROL), Some(&Role::Owner));
    assert!(!snapshot.presence.online.contains_key(&CAROL));
}

#[tokio::test]
async fn ban_of_local_user_logs_out_while_a_fetch_is_in_flight() {
    let harness = Harness::connected().await;
    harness.engine.join_voice(LOUNGE).await.expect("join voice");
    harness
        .data
        .set_history(RANDOM, vec![message(900, RANDOM, BOB, 900)]);
    harness.data.gate(Gate::History(RANDOM));

    let engine = harness.engine.clone();
    let pending = tokio::spawn(async move { engine.select_channel(RANDOM, "random").await });
    harness.data.wait_for_held(Gate::History(RANDOM)).await;
    let mut events = harness.engine.subscribe_events();

    harness.transport.emit(ServerEvent::UserBanned { user_id: ME });
    settle().await;

    assert_eq!(harness.navigator.logouts(), vec![LogoutReason::Banned]);
    assert!(drain(&mut events).contains(&ClientEvent::LoggedOut(LogoutReason::Banned)));
    assert!(harness.transport.handler().is_none());
    assert_eq!(harness.transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(harness.media.leaves.load(Ordering::SeqCst), 1);

    harness.data.release(Gate::History(RANDOM));
    pending.await.expect("join");

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.phase, SessionPhase::Disconnected);
    assert!(snapshot.me.is_none());
    assert!(snapshot.channels.is_empty());
    assert!(snapshot.channel.messages.is_empty());
    assert!(snapshot.voice.local_channel.is_none());
    assert_eq!(snapshot.active_timers, 0);
}

#[tokio::test]
async fn kick_of_another_user_changes_nothing() {
    let harness = Harness::connected().await;
    let before = harness.snapshot().await;

    harness
        .engine
        .dispatch(ServerEvent::UserKicked { user_id: BOB })
        .await;

    assert!(harness.navigator.logouts().is_empty());
    assert_eq!(harness.snapshot().await, before);
}

#[tokio::test]
async fn kick_of_local_user_logs_out() {
    let harness = Harness::connected().await;
    harness
        .engine
        .dispatch(ServerEvent::UserKicked { user_id: ME })
        .await;
    assert_eq!(harness.navigator.logouts(), vec![LogoutReason::Kicked]);
    assert_eq!(harness.engine.phase().await, SessionPhase::Disconnected);
}

#[tokio::test]
async fn unauthorized_stream_error_logs_out() {
    let harness = Harness::connected().await;
    harness
        .engine
        .dispatch(ServerEvent::Error(ApiError::new(
            ErrorCode::Unauthorized,
            "token expired",
        )))
        .await;
    assert_eq!(harness.navigator.logouts(), vec![LogoutReason::AuthExpired]);
}

#[tokio::test]
async fn other_stream_errors_surface_without_state_change() {
    let harness = Harness::connected().await;
    let before = harness.snapshot().await;
    let mut events = harness.engine.subscribe_events();

    harness
        .engine
        .dispatch(ServerEvent::Error(ApiError::new(ErrorCode::Forbidden, "nope")))
        .await;

    assert!(matches!(drain(&mut events).as_slice(), [ClientEvent::Error(text)] if text.contains("nope")));
    assert_eq!(harness.snapshot().await, before);
    assert!(harness.navigator.logouts().is_empty());
}

#[tokio::test]
async fn auth_expiry_on_command_logs_out() {
    let harness = Harness::connected().await;
    harness.data.fail_commands(Some(Failure::AuthExpired));

    let err = harness
        .engine
        .delete_message(MessageId(1))
        .await
        .expect_err("expired");
    assert!(matches!(err, crate::ClientError::AuthExpired));
    assert_eq!(harness.navigator.logouts(), vec![LogoutReason::AuthExpired]);
    assert_eq!(harness.engine.phase().await, SessionPhase::Disconnected);
}
