mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time;

use fitra_realtime::bus::connection::{Delivery, Handler};
use fitra_realtime::bus::frame::{Command, Header};
use fitra_realtime::bus::topics::Topic;
use fitra_realtime::chat::{Cursor, RoomState, Side};
use fitra_realtime::error::RealtimeError;
use fitra_realtime::RealtimeSession;

use common::{chat_room, eventually, login, message, message_json, FakeChatApi, MemoryBroker, VIEWER};

const PEER: i64 = 8;

async fn with_rooms(broker: &MemoryBroker, api: &Arc<FakeChatApi>) -> RealtimeSession {
    api.set_rooms(vec![
        chat_room(1, PEER, Some(message(PEER, "hey", 0))),
        chat_room(2, 9, None),
    ]);
    let session = login(broker, api.clone()).await;
    session.chat.load_rooms().await.expect("rooms");
    session
}

#[tokio::test]
async fn selecting_a_room_loads_history_then_goes_live() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    let history = vec![message(PEER, "hey", 0), message(VIEWER, "hi!", 1)];
    api.set_history(1, history.clone());
    let session = with_rooms(&broker, &api).await;

    assert_eq!(session.chat.state(), RoomState::NoRoomSelected);
    session.chat.select_room(1).await.unwrap();

    assert_eq!(session.chat.state(), RoomState::Live { room_id: 1 });
    assert_eq!(session.chat.messages(), history);
    assert_eq!(session.chat.messages()[0].side(VIEWER), Side::Theirs);
    assert_eq!(session.chat.messages()[1].side(VIEWER), Side::Mine);
    eventually("room topic", || broker.subscribers("/chat-room/1") == 1).await;

    // Selecting the live room again does nothing.
    session.chat.select_room(1).await.unwrap();
    assert_eq!(api.history_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn live_messages_append_in_delivery_order() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    api.set_history(1, vec![message(PEER, "hey", 0)]);
    let session = with_rooms(&broker, &api).await;
    session.chat.select_room(1).await.unwrap();
    eventually("room topic", || broker.subscribers("/chat-room/1") == 1).await;

    let mut rx = session.chat.subscribe_messages();
    let (a, b) = (message(PEER, "one", 5), message(PEER, "two", 3));
    broker.push("/chat-room/1", message_json(&a));
    broker.push("/chat-room/1", message_json(&b));

    let first = time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    let second = time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!((first.room_id, &first.message), (1, &a));
    assert_eq!(second.message, b);

    let contents: Vec<String> = session.chat.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["hey", "one", "two"]);
    assert_eq!(session.chat.room(1).unwrap().preview(VIEWER).as_deref(), Some("two"));
}

#[tokio::test]
async fn messages_during_history_load_are_merged_without_duplicates() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    let (m1, m2, m3) = (message(PEER, "a", 0), message(VIEWER, "b", 1), message(PEER, "c", 2));
    api.set_history(1, vec![m1.clone()]);
    let session = with_rooms(&broker, &api).await;

    api.hold_history();
    let chat = session.chat.clone();
    let select = tokio::spawn(async move { chat.select_room(1).await });

    eventually("room topic before history", || broker.subscribers("/chat-room/1") == 1).await;
    assert_eq!(session.chat.state(), RoomState::LoadingHistory { room_id: 1 });

    // m2 was persisted before the fetch reads history, m3 only arrives live.
    api.append_history(1, m2.clone());
    broker.push("/chat-room/1", message_json(&m2));
    broker.push("/chat-room/1", message_json(&m3));
    time::sleep(Duration::from_millis(50)).await;

    api.release_history();
    select.await.unwrap().unwrap();

    assert_eq!(session.chat.state(), RoomState::Live { room_id: 1 });
    assert_eq!(session.chat.messages(), vec![m1, m2, m3]);
}

#[tokio::test]
async fn leaving_and_returning_does_not_duplicate_messages() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    api.set_history(1, vec![message(PEER, "a", 0), message(VIEWER, "b", 1)]);
    let session = with_rooms(&broker, &api).await;
    session.chat.select_room(1).await.unwrap();
    eventually("room topic", || broker.subscribers("/chat-room/1") == 1).await;

    let live = message(PEER, "c", 2);
    api.append_history(1, live.clone());
    broker.push("/chat-room/1", message_json(&live));
    eventually("live append", || session.chat.messages().len() == 3).await;

    assert!(session.chat.leave());
    assert!(!session.chat.leave());
    assert_eq!(session.chat.state(), RoomState::Closed { room_id: 1 });
    assert_eq!(session.chat.cached_history(1).unwrap().len(), 3);
    eventually("room topic released", || broker.subscribers("/chat-room/1") == 0).await;

    session.chat.select_room(1).await.unwrap();
    assert_eq!(session.chat.messages().len(), 3);
    eventually("one room subscription", || broker.subscribers("/chat-room/1") == 1).await;

    broker.push("/chat-room/1", message_json(&message(PEER, "d", 3)));
    eventually("single append", || session.chat.messages().len() == 4).await;
    time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.chat.messages().len(), 4);
}

#[tokio::test]
async fn history_arriving_after_leave_is_discarded() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    api.set_history(1, vec![message(PEER, "a", 0)]);
    let session = with_rooms(&broker, &api).await;

    api.hold_history();
    let chat = session.chat.clone();
    let select = tokio::spawn(async move { chat.select_room(1).await });
    eventually("loading", || {
        session.chat.state() == RoomState::LoadingHistory { room_id: 1 }
    })
    .await;

    session.chat.leave();
    api.release_history();
    select.await.unwrap().expect("stale history is not an error");

    assert_eq!(session.chat.state(), RoomState::Closed { room_id: 1 });
    assert!(session.chat.messages().is_empty());
}

#[tokio::test]
async fn superseded_selection_keeps_only_the_newest_room() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    api.set_history(1, vec![message(PEER, "room one", 0)]);
    api.set_history(2, vec![message(9, "room two", 0)]);
    let session = with_rooms(&broker, &api).await;

    api.hold_history();
    let chat = session.chat.clone();
    let first = tokio::spawn(async move { chat.select_room(1).await });
    eventually("first fetch", || api.history_calls.load(Ordering::SeqCst) == 1).await;
    let chat = session.chat.clone();
    let second = tokio::spawn(async move { chat.select_room(2).await });
    eventually("second fetch", || api.history_calls.load(Ordering::SeqCst) == 2).await;

    api.release_history();
    first.await.unwrap().unwrap();
    api.release_history();
    second.await.unwrap().unwrap();

    assert_eq!(session.chat.state(), RoomState::Live { room_id: 2 });
    let contents: Vec<String> = session.chat.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["room two"]);
    eventually("only room 2 subscribed", || {
        broker.subscribers("/chat-room/1") == 0 && broker.subscribers("/chat-room/2") == 1
    })
    .await;
}

#[tokio::test]
async fn selecting_a_loading_room_again_waits_for_the_same_load() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    api.set_history(1, vec![message(PEER, "a", 0)]);
    let session = with_rooms(&broker, &api).await;

    api.hold_history();
    let chat = session.chat.clone();
    let first = tokio::spawn(async move { chat.select_room(1).await });
    eventually("first fetch", || api.history_calls.load(Ordering::SeqCst) == 1).await;
    let chat = session.chat.clone();
    let second = tokio::spawn(async move { chat.select_room(1).await });
    time::sleep(Duration::from_millis(30)).await;
    assert!(!second.is_finished(), "resolved before the room was live");

    api.release_history();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(session.chat.state(), RoomState::Live { room_id: 1 });
    assert_eq!(api.history_calls.load(Ordering::SeqCst), 1);
    assert_eq!(session.chat.messages().len(), 1);
}

#[tokio::test]
async fn leftover_room_registration_is_replaced_on_select() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    api.set_history(1, vec![message(PEER, "a", 0)]);
    let session = with_rooms(&broker, &api).await;

    let leftover: Handler = Arc::new(|_: Delivery| {});
    session
        .registry
        .register_topic(Topic::ChatRoom { room_id: 1 }, leftover)
        .unwrap();

    session.chat.select_room(1).await.unwrap();
    eventually("room subscription swapped", || {
        let subscribes = broker
            .frames(Command::Subscribe)
            .iter()
            .filter(|f| f.get(Header::DESTINATION) == Some("/chat-room/1"))
            .count();
        subscribes == 2 && broker.subscribers("/chat-room/1") == 1
    })
    .await;

    broker.push("/chat-room/1", message_json(&message(PEER, "b", 1)));
    eventually("live append", || session.chat.messages().len() == 2).await;
    assert_eq!(session.chat.state(), RoomState::Live { room_id: 1 });
}

#[tokio::test]
async fn failed_history_fetch_returns_to_no_room() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    let session = with_rooms(&broker, &api).await;
    api.fail_history(true);

    let err = session.chat.select_room(1).await.unwrap_err();
    assert!(matches!(err, RealtimeError::Http(_)), "{err:?}");
    assert_eq!(session.chat.state(), RoomState::NoRoomSelected);
    eventually("room topic released", || broker.subscribers("/chat-room/1") == 0).await;

    assert!(matches!(
        session.chat.select_room(42).await,
        Err(RealtimeError::UnknownRoom(42))
    ));
}

#[tokio::test]
async fn send_requires_a_live_room_and_content() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    let session = with_rooms(&broker, &api).await;

    assert!(matches!(session.chat.send("hello"), Err(RealtimeError::NotConnected)));

    session.chat.select_room(1).await.unwrap();
    assert!(matches!(session.chat.send("   "), Err(RealtimeError::EmptyMessage)));

    session.chat.send("hello").unwrap();
    eventually("chat send", || broker.sent_to("/app/chat/1").len() == 1).await;
    assert_eq!(
        broker.sent_to("/app/chat/1")[0],
        json!({ "senderId": VIEWER, "recipientId": PEER, "content": "hello" })
    );
    // Optimistic snapshot before any echo.
    assert_eq!(
        session.chat.room(1).unwrap().preview(VIEWER).as_deref(),
        Some("You: hello")
    );
    assert_eq!(session.chat.messages().len(), 0);

    session.chat.send_confirmed("again").await.unwrap();
    assert_eq!(broker.sent_to("/app/chat/1").len(), 2);

    session.chat.leave();
    assert!(matches!(session.chat.send("late"), Err(RealtimeError::NotConnected)));
}

#[tokio::test]
async fn room_unread_updates_patch_the_snapshot() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    let session = with_rooms(&broker, &api).await;
    let topic = "/unread-topic/chat-rooms/1/user/7";
    eventually("unread topic", || broker.subscribers(topic) == 1).await;

    broker.push(
        topic,
        json!({
            "lastMessage": { "sender": { "id": PEER }, "content": "yo", "timestamp": "2024-05-01T13:00:00" },
            "unread": true
        }),
    );
    eventually("unread flag", || session.chat.room(1).unwrap().unread).await;
    assert_eq!(session.chat.room(1).unwrap().preview(VIEWER).as_deref(), Some("yo"));

    broker.push(topic, json!({ "unread": false }));
    eventually("read", || !session.chat.room(1).unwrap().unread).await;
    assert_eq!(session.chat.room(1).unwrap().preview(VIEWER).as_deref(), Some("yo"));
}

#[tokio::test]
async fn reloading_rooms_releases_topics_of_vanished_rooms() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    let session = with_rooms(&broker, &api).await;
    eventually("both unread topics", || {
        broker.subscribers("/unread-topic/chat-rooms/1/user/7") == 1
            && broker.subscribers("/unread-topic/chat-rooms/2/user/7") == 1
    })
    .await;

    api.set_rooms(vec![chat_room(2, 9, None)]);
    let rooms = session.chat.load_rooms().await.unwrap();
    assert_eq!(rooms.len(), 1);
    eventually("room 1 released", || {
        broker.subscribers("/unread-topic/chat-rooms/1/user/7") == 0
            && broker.subscribers("/unread-topic/chat-rooms/2/user/7") == 1
    })
    .await;

    session.chat.detach();
    eventually("all released", || {
        broker.subscribers("/unread-topic/chat-rooms/2/user/7") == 0
    })
    .await;
}

#[tokio::test]
async fn open_with_user_reuses_or_creates_the_room() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    let session = with_rooms(&broker, &api).await;

    assert_eq!(session.chat.open_with_user(PEER).await.unwrap(), 1);
    assert!(api.created_with.lock().is_empty());

    let created = session.chat.open_with_user(77).await.unwrap();
    assert_eq!(created, 1000);
    assert_eq!(*api.created_with.lock(), vec![77]);
    assert_eq!(session.chat.rooms()[0].id, 1000);
    assert_eq!(session.chat.state(), RoomState::Live { room_id: 1000 });
    eventually("new room topics", || {
        broker.subscribers("/unread-topic/chat-rooms/1000/user/7") == 1
            && broker.subscribers("/chat-room/1000") == 1
            && broker.subscribers("/chat-room/1") == 0
    })
    .await;
}

#[tokio::test]
async fn cursor_reads_each_message_once() {
    let broker = MemoryBroker::new();
    let api = FakeChatApi::new();
    api.set_history(1, vec![message(PEER, "a", 0)]);
    let session = with_rooms(&broker, &api).await;
    session.chat.select_room(1).await.unwrap();
    eventually("room topic", || broker.subscribers("/chat-room/1") == 1).await;

    let (batch, cursor) = session.chat.messages_since(Cursor::default());
    assert_eq!(batch.len(), 1);

    broker.push("/chat-room/1", message_json(&message(PEER, "b", 1)));
    eventually("append", || session.chat.messages().len() == 2).await;
    let (batch, cursor) = session.chat.messages_since(cursor);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].content, "b");

    let (batch, stale) = session.chat.messages_since(cursor);
    assert!(batch.is_empty());

    // Restarting the sequence hands everything out again.
    session.chat.leave();
    session.chat.select_room(1).await.unwrap();
    let (batch, _) = session.chat.messages_since(stale);
    assert_eq!(batch.len(), 1);
}
