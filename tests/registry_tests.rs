//! Conversation registry tests
//!
//! Direct/group lifecycle, membership rules and per-member unread counters
//! against an in-memory database.

mod common;

use chrono::{Duration, Utc};
use common::{TestContext, deactivate_user, drain, next_event};
use petnet_realtime::core::broadcast::{Channel, authorize};
use petnet_realtime::core::errors::ChatError;
use petnet_realtime::infrastructure::entities::{MemberRole, Message};
use uuid::Uuid;

#[tokio::test]
async fn test_direct_conversation_is_unique_per_pair() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;

    // both sides open the conversation at the same moment
    let (first, second) = tokio::join!(
        ctx.registry.get_or_create_direct(alice, bob),
        ctx.registry.get_or_create_direct(bob, alice),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.id, second.id);
    assert!(!first.is_group);
    assert_eq!(ctx.count("SELECT COUNT(*) FROM conversations").await, 1);
    assert_eq!(
        ctx.count("SELECT COUNT(*) FROM conversation_members").await,
        2
    );

    let again = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();
    assert_eq!(again.id, first.id);
}

#[tokio::test]
async fn test_direct_conversation_with_self_is_rejected() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;

    let result = ctx.registry.get_or_create_direct(alice, alice).await;

    assert!(matches!(result, Err(ChatError::SelfConversation)));
    assert_eq!(ctx.count("SELECT COUNT(*) FROM conversations").await, 0);
}

#[tokio::test]
async fn test_direct_conversation_needs_active_users() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let ghost = uuid::Uuid::new_v4();
    let banned = ctx.user("banned").await;
    deactivate_user(&ctx.pool, banned).await;

    let result = ctx.registry.get_or_create_direct(alice, ghost).await;
    assert!(matches!(result, Err(ChatError::InvalidParticipant(id)) if id == ghost));

    let result = ctx.registry.get_or_create_direct(alice, banned).await;
    assert!(matches!(result, Err(ChatError::InvalidParticipant(id)) if id == banned));
}

#[tokio::test]
async fn test_new_direct_conversation_is_announced_to_the_other_side() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let mut bob_events = ctx.subscribe(Channel::User(bob)).await;

    let conversation = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();

    let event = next_event(&mut bob_events).await;
    assert_eq!(event.event, "conversation.added");
    assert_eq!(event.payload["conversation_id"], conversation.id.to_string());

    // reopening an existing conversation is silent
    ctx.registry.get_or_create_direct(bob, alice).await.unwrap();
    assert!(drain(&mut bob_events).await.is_empty());
}

#[tokio::test]
async fn test_direct_membership_is_immutable() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let carol = ctx.user("carol").await;
    let conversation = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();

    let result = ctx.registry.add_member(conversation.id, alice, bob).await;
    assert!(matches!(result, Err(ChatError::AlreadyMember)));

    let result = ctx.registry.add_member(conversation.id, alice, carol).await;
    assert!(matches!(result, Err(ChatError::NotGroupConversation)));

    let result = ctx.registry.remove_member(conversation.id, alice, bob).await;
    assert!(matches!(result, Err(ChatError::NotGroupConversation)));
}

#[tokio::test]
async fn test_group_creator_is_admin_and_duplicates_collapse() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let carol = ctx.user("carol").await;

    let group = ctx
        .registry
        .create_group(
            alice,
            vec![bob, carol, bob, alice],
            Some("  Dog park crew ".to_owned()),
            None,
        )
        .await
        .unwrap();

    assert!(group.is_group);
    assert_eq!(group.name.as_deref(), Some("Dog park crew"));

    let members = ctx.registry.list_members(group.id, bob).await.unwrap();
    assert_eq!(members.len(), 3);
    assert_eq!(members[0].user_id, alice);
    assert_eq!(members[0].role, Some(MemberRole::Admin));
    assert!(members[1..]
        .iter()
        .all(|m| m.role == Some(MemberRole::Member)));

    let summary = ctx.registry.get_for_user(group.id, carol).await.unwrap();
    assert_eq!(summary.member_count, 3);
    assert_eq!(summary.unread_count, 0);
}

#[tokio::test]
async fn test_group_with_unknown_member_is_not_created() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let ghost = uuid::Uuid::new_v4();

    let result = ctx.registry.create_group(alice, vec![ghost], None, None).await;

    assert!(matches!(result, Err(ChatError::InvalidParticipant(id)) if id == ghost));
    assert_eq!(ctx.count("SELECT COUNT(*) FROM conversations").await, 0);
}

#[tokio::test]
async fn test_group_membership_changes() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let carol = ctx.user("carol").await;
    let dave = ctx.user("dave").await;
    let group = ctx
        .registry
        .create_group(alice, vec![bob], None, None)
        .await
        .unwrap();
    let mut group_events = ctx.subscribe(Channel::Conversation(group.id)).await;
    let mut carol_events = ctx.subscribe(Channel::User(carol)).await;

    // members may add, outsiders may not
    assert!(ctx.registry.add_member(group.id, bob, carol).await.unwrap());
    let result = ctx.registry.add_member(group.id, dave, dave).await;
    assert!(matches!(result, Err(ChatError::NotMember)));

    // a retried add is a no-op
    assert!(!ctx.registry.add_member(group.id, alice, carol).await.unwrap());

    let changed = next_event(&mut group_events).await;
    assert_eq!(changed.event, "conversation.members_changed");
    assert_eq!(changed.payload["added"][0], carol.to_string());
    assert!(drain(&mut group_events).await.is_empty());
    assert_eq!(next_event(&mut carol_events).await.event, "conversation.added");

    // only admins remove other people
    let result = ctx.registry.remove_member(group.id, bob, carol).await;
    assert!(matches!(result, Err(ChatError::NotGroupAdmin)));
    ctx.registry.remove_member(group.id, alice, carol).await.unwrap();
    assert_eq!(
        next_event(&mut carol_events).await.event,
        "conversation.removed"
    );

    let result = ctx.registry.remove_member(group.id, alice, carol).await;
    assert!(matches!(result, Err(ChatError::NotMember)));

    // anyone may leave
    ctx.registry.remove_member(group.id, bob, bob).await.unwrap();
    let members = ctx.registry.list_members(group.id, alice).await.unwrap();
    assert_eq!(members.len(), 1);
}

#[tokio::test]
async fn test_group_is_deactivated_when_last_member_leaves() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let group = ctx
        .registry
        .create_group(alice, vec![], Some("Solo".to_owned()), None)
        .await
        .unwrap();

    ctx.registry.remove_member(group.id, alice, alice).await.unwrap();

    let result = ctx.registry.get_for_user(group.id, alice).await;
    assert!(matches!(result, Err(ChatError::NotFound(_))));
    assert!(ctx.registry.list_for_user(alice).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_only_admin_updates_group() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let group = ctx
        .registry
        .create_group(alice, vec![bob], Some("Cats".to_owned()), None)
        .await
        .unwrap();

    let result = ctx
        .registry
        .update_group(group.id, bob, Some("Dogs".to_owned()), None)
        .await;
    assert!(matches!(result, Err(ChatError::NotGroupAdmin)));

    let updated = ctx
        .registry
        .update_group(group.id, alice, None, Some("Whiskers only".to_owned()))
        .await
        .unwrap();
    assert_eq!(updated.name.as_deref(), Some("Cats"));
    assert_eq!(updated.description.as_deref(), Some("Whiskers only"));
}

#[tokio::test]
async fn test_get_for_user_checks_membership() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let mallory = ctx.user("mallory").await;
    let conversation = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();

    let result = ctx.registry.get_for_user(conversation.id, mallory).await;
    assert!(matches!(result, Err(ChatError::NotMember)));

    let result = ctx.registry.get_for_user(uuid::Uuid::new_v4(), alice).await;
    assert!(matches!(result, Err(ChatError::NotFound(_))));
}

#[tokio::test]
async fn test_conversations_are_ordered_by_activity() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let carol = ctx.user("carol").await;

    let with_bob = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();
    let with_carol = ctx.registry.get_or_create_direct(alice, carol).await.unwrap();

    let listed = ctx.registry.list_for_user(alice).await.unwrap();
    assert_eq!(listed[0].conversation.id, with_carol.id);

    ctx.dispatcher
        .send(with_bob.id, bob, Some("woof".to_owned()), None)
        .await
        .unwrap();

    let listed = ctx.registry.list_for_user(alice).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].conversation.id, with_bob.id);
    assert_eq!(listed[0].unread_count, 1);
    assert_eq!(listed[0].last_message_content.as_deref(), Some("woof"));
    assert_eq!(listed[0].last_message_sender_id, Some(bob));
    assert_eq!(listed[1].conversation.id, with_carol.id);
    assert_eq!(listed[1].last_message_id, None);
}

#[tokio::test]
async fn test_hidden_direct_conversation_reappears_on_new_message() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let conversation = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();
    ctx.dispatcher
        .send(conversation.id, bob, Some("old news".to_owned()), None)
        .await
        .unwrap();

    ctx.registry.hide_direct(conversation.id, alice).await.unwrap();

    assert!(ctx.registry.list_for_user(alice).await.unwrap().is_empty());
    // the other participant is unaffected
    assert_eq!(ctx.registry.list_for_user(bob).await.unwrap().len(), 1);

    ctx.dispatcher
        .send(conversation.id, bob, Some("are you there?".to_owned()), None)
        .await
        .unwrap();

    let listed = ctx.registry.list_for_user(alice).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread_count, 1);

    // history before the delete stays hidden for alice only
    let history = ctx
        .dispatcher
        .list_messages(conversation.id, alice, None, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content.as_deref(), Some("are you there?"));
    let history = ctx
        .dispatcher
        .list_messages(conversation.id, bob, None, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_reopening_hidden_conversation_restores_it() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let conversation = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();

    ctx.registry.hide_direct(conversation.id, alice).await.unwrap();
    assert!(ctx.registry.list_for_user(alice).await.unwrap().is_empty());

    ctx.registry.get_or_create_direct(alice, bob).await.unwrap();
    assert_eq!(ctx.registry.list_for_user(alice).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_hide_is_for_direct_conversations_only() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let group = ctx
        .registry
        .create_group(alice, vec![], None, None)
        .await
        .unwrap();

    let result = ctx.registry.hide_direct(group.id, alice).await;
    assert!(matches!(result, Err(ChatError::NotGroupConversation)));
}

#[tokio::test]
async fn test_mark_read_is_idempotent() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let conversation = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();

    // nothing to read yet
    assert_eq!(ctx.registry.mark_read(conversation.id, bob).await.unwrap(), 0);

    for text in ["one", "two", "three"] {
        ctx.dispatcher
            .send(conversation.id, alice, Some(text.to_owned()), None)
            .await
            .unwrap();
    }
    assert_eq!(ctx.registry.unread_count(conversation.id, bob).await.unwrap(), 3);
    assert_eq!(ctx.registry.unread_count(conversation.id, alice).await.unwrap(), 0);

    let mut bob_events = ctx.subscribe(Channel::User(bob)).await;
    assert_eq!(ctx.registry.mark_read(conversation.id, bob).await.unwrap(), 0);
    assert_eq!(ctx.registry.mark_read(conversation.id, bob).await.unwrap(), 0);

    let read = next_event(&mut bob_events).await;
    assert_eq!(read.event, "conversation.read");
    assert_eq!(read.payload["unread_count"], 0);

    let result = ctx.registry.mark_read(conversation.id, ctx.user("eve").await).await;
    assert!(matches!(result, Err(ChatError::NotMember)));
}

#[tokio::test]
async fn test_removed_member_stops_receiving_conversation_events() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let carol = ctx.user("carol").await;
    let group = ctx
        .registry
        .create_group(alice, vec![bob, carol], None, None)
        .await
        .unwrap();
    let channel = Channel::Conversation(group.id);

    authorize(&*ctx.conversations, &channel, bob).await.unwrap();
    let mut bob_events = ctx.subscribe_as(channel, bob).await;
    let mut carol_events = ctx.subscribe_as(channel, carol).await;

    ctx.registry.remove_member(group.id, alice, bob).await.unwrap();
    ctx.dispatcher
        .send(group.id, alice, Some("plans for the vet visit".to_owned()), None)
        .await
        .unwrap();

    assert!(drain(&mut bob_events).await.is_empty());
    assert!(bob_events.next().await.is_none());
    let result = authorize(&*ctx.conversations, &channel, bob).await;
    assert!(matches!(result, Err(ChatError::NotMember)));

    let received: Vec<_> = drain(&mut carol_events)
        .await
        .into_iter()
        .map(|event| event.event.clone())
        .collect();
    assert_eq!(received, ["conversation.members_changed", "message.sent"]);
}

#[tokio::test]
async fn test_last_admin_leaving_promotes_earliest_member() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let carol = ctx.user("carol").await;
    let group = ctx
        .registry
        .create_group(alice, vec![bob, carol], Some("Pug owners".to_owned()), None)
        .await
        .unwrap();
    let mut group_events = ctx.subscribe(Channel::Conversation(group.id)).await;

    ctx.registry.remove_member(group.id, alice, alice).await.unwrap();

    let changed = next_event(&mut group_events).await;
    assert_eq!(changed.payload["removed"][0], alice.to_string());
    assert_eq!(changed.payload["promoted_admin"], bob.to_string());

    let members = ctx.registry.list_members(group.id, bob).await.unwrap();
    assert_eq!(members[0].user_id, bob);
    assert_eq!(members[0].role, Some(MemberRole::Admin));
    assert_eq!(members[1].role, Some(MemberRole::Member));

    // the group stays manageable
    ctx.registry
        .update_group(group.id, bob, Some("Pug pals".to_owned()), None)
        .await
        .unwrap();
    ctx.registry.remove_member(group.id, bob, carol).await.unwrap();

    // an admin leaving while another admin remains promotes nobody
    let dave = ctx.user("dave").await;
    ctx.registry.add_member(group.id, bob, dave).await.unwrap();
    drain(&mut group_events).await;
    ctx.registry.remove_member(group.id, dave, dave).await.unwrap();
    let changed = next_event(&mut group_events).await;
    assert!(changed.payload.get("promoted_admin").is_none());
}

#[tokio::test]
async fn test_hide_stops_at_the_read_marker() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let conversation = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();
    ctx.dispatcher
        .send(conversation.id, bob, Some("walk at six?".to_owned()), None)
        .await
        .unwrap();

    ctx.registry.hide_direct(conversation.id, alice).await.unwrap();

    let membership = ctx
        .conversations
        .find_membership(conversation.id, alice)
        .await
        .unwrap()
        .unwrap();
    assert!(membership.hidden_at.is_some());
    assert_eq!(membership.hidden_at, membership.last_read_at);

    // a send that read the clock before the hide committed after it
    ctx.messages
        .create_message(Message {
            id: Uuid::now_v7(),
            conversation_id: conversation.id,
            sender_id: bob,
            content: Some("still on?".to_owned()),
            image_url: None,
            created_at: Utc::now() - Duration::seconds(5),
            deleted_at: None,
        })
        .await
        .unwrap()
        .unwrap();

    let listed = ctx.registry.list_for_user(alice).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread_count, 1);
}

#[tokio::test]
async fn test_hiding_an_empty_conversation_until_first_message() {
    let ctx = TestContext::new().await;
    let alice = ctx.user("alice").await;
    let bob = ctx.user("bob").await;
    let conversation = ctx.registry.get_or_create_direct(alice, bob).await.unwrap();

    ctx.registry.hide_direct(conversation.id, alice).await.unwrap();
    assert!(ctx.registry.list_for_user(alice).await.unwrap().is_empty());

    ctx.dispatcher
        .send(conversation.id, bob, Some("hello".to_owned()), None)
        .await
        .unwrap();
    let listed = ctx.registry.list_for_user(alice).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread_count, 1);
}
