use super::*;
use crate::connection::{ConnectionState, Transport};
use crate::store::ConversationSnapshot;
use crate::types::Conversation;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

type Feed = mpsc::UnboundedSender<Result<RawEvent, TransportError>>;

struct FakeTransport {
    rx: mpsc::UnboundedReceiver<Result<RawEvent, TransportError>>,
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn next_event(&mut self) -> Option<Result<RawEvent, TransportError>> {
        self.rx.recv().await
    }
}

#[derive(Default)]
struct FakeConnector {
    feeds: Mutex<Vec<Feed>>,
}

impl FakeConnector {
    fn count(&self) -> usize {
        self.feeds.lock().expect("lock").len()
    }

    fn take_feed(&self, index: usize) -> Feed {
        self.feeds.lock().expect("lock")[index].clone()
    }

    fn drop_all(&self) {
        self.feeds.lock().expect("lock").clear();
    }
}

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn open(&self, _scope_id: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().expect("lock").push(tx);
        Ok(Box::new(FakeTransport { rx }))
    }
}

/// Serves a fixed inbox page and counts fetches.
#[derive(Default)]
struct PageApi {
    page: Mutex<Vec<Conversation>>,
    fetches: Mutex<usize>,
}

#[async_trait::async_trait]
impl ChatApi for PageApi {
    async fn send_message(&self, conversation_id: &str, body: &crate::api::SendMessageBody) -> Result<Message, ApiError> {
        Ok(Message {
            id: "srv-1".to_owned(),
            conversation_id: conversation_id.to_owned(),
            sender: crate::types::SenderKind::Human,
            content: body.content.clone(),
            kind: body.kind,
            status: crate::types::MessageStatus::Sent,
            timestamp: 5,
            reply_to: None,
        })
    }

    async fn mark_conversation_read(&self, _conversation_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn get_conversations(&self, _filters: &ConversationFilters) -> Result<ConversationPage, ApiError> {
        *self.fetches.lock().expect("lock") += 1;
        let conversations = self.page.lock().expect("lock").clone();
        Ok(ConversationPage { total: conversations.len() as u64, has_more: false, conversations })
    }
}

fn conversation(id: &str, updated_at: i64) -> Conversation {
    serde_json::from_value(json!({"id": id, "updated_at": updated_at})).expect("conversation")
}

fn message_received(event_id: &str, conversation_id: &str, message_id: &str, ts: i64) -> RawEvent {
    RawEvent::Text(
        json!({
            "id": event_id,
            "type": "messageReceived",
            "data": {
                "conversation": {"id": conversation_id, "updated_at": ts, "unread_count": 1},
                "message": {"id": message_id, "sender": "customer", "content": "hi", "timestamp": ts}
            }
        })
        .to_string(),
    )
}

fn client(api: Arc<PageApi>, connector: Arc<FakeConnector>) -> SyncClient {
    let backoff = BackoffPolicy {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: 5,
    };
    SyncClient::from_parts(api, connector, backoff, 16)
}

async fn until(mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

#[tokio::test(start_paused = true)]
async fn pushed_messages_reach_subscribers_once() {
    let connector = Arc::new(FakeConnector::default());
    let client = client(Arc::new(PageApi::default()), connector.clone());

    let seen: Arc<Mutex<Vec<ConversationSnapshot>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _sub = client
        .state()
        .subscribe("c1", move |snapshot: &ConversationSnapshot| sink.lock().expect("lock").push(snapshot.clone()));

    let handle = client.connect("org-1");
    until(|| connector.count() == 1).await;
    until(|| !client.state().is_stale()).await;

    let feed = connector.take_feed(0);
    feed.send(Ok(message_received("evt-1", "c1", "m1", 100))).expect("feed");
    feed.send(Ok(message_received("evt-1", "c1", "m1", 100))).expect("feed");
    until(|| seen.lock().expect("lock").iter().any(|s| s.messages.len() == 1)).await;

    let last = seen.lock().expect("lock").last().cloned().expect("snapshot");
    assert!(!last.stale);
    assert_eq!(last.messages[0].id, "m1");
    assert_eq!(last.conversation.map(|c| c.unread_count), Some(1));
    assert_eq!(client.connection(&handle).map(|s| s.state), Some(ConnectionState::Open));
}

#[tokio::test(start_paused = true)]
async fn reconnect_refetches_and_merges_first_page() {
    let api = Arc::new(PageApi::default());
    let connector = Arc::new(FakeConnector::default());
    let client = client(api.clone(), connector.clone());

    let _handle = client.connect("org-1");
    until(|| connector.count() == 1).await;
    assert_eq!(*api.fetches.lock().expect("lock"), 0, "first open does not resync");

    api.page.lock().expect("lock").push(conversation("c9", 900));
    connector.drop_all();
    until(|| connector.count() == 1).await;
    until(|| *api.fetches.lock().expect("lock") == 1).await;
    until(|| client.state().read(|store| store.conversation("c9").is_some())).await;

    assert!(!client.state().is_stale());
}

#[tokio::test(start_paused = true)]
async fn dropped_connection_marks_data_stale() {
    let connector = Arc::new(FakeConnector::default());
    let client = client(Arc::new(PageApi::default()), connector.clone());

    let handle = client.connect("org-1");
    until(|| !client.state().is_stale()).await;

    assert!(client.disconnect(&handle));
    assert!(client.state().is_stale());
    assert_eq!(client.state().connection().map(|s| s.state), Some(ConnectionState::Closed));
}

#[tokio::test]
async fn load_conversations_merges_page() {
    let api = Arc::new(PageApi::default());
    api.page.lock().expect("lock").extend([conversation("c1", 10), conversation("c2", 20)]);
    let client = client(api, Arc::new(FakeConnector::default()));

    let page = client.load_conversations(&ConversationFilters::default()).await.expect("page");

    assert_eq!(page.total, 2);
    let order: Vec<_> = client
        .state()
        .read(|store| store.conversations().into_iter().map(|c| c.id).collect());
    assert_eq!(order, vec!["c2", "c1"]);
}

#[tokio::test]
async fn send_through_client_lands_confirmed() {
    let api = Arc::new(PageApi::default());
    api.page.lock().expect("lock").push(conversation("c1", 10));
    let client = client(api, Arc::new(FakeConnector::default()));
    client.load_conversations(&ConversationFilters::default()).await.expect("page");

    let message = client.send_message("c1", Draft::text("hello")).await.expect("send");

    assert_eq!(message.id, "srv-1");
    let ids: Vec<_> = client
        .state()
        .read(|store| store.messages("c1").into_iter().map(|m| m.id).collect());
    assert_eq!(ids, vec!["srv-1"]);
    assert_eq!(client.mark_read("c1").await, Ok(true));
}

#[tokio::test]
async fn close_conversation_forgets_it() {
    let api = Arc::new(PageApi::default());
    api.page.lock().expect("lock").push(conversation("c1", 10));
    let client = client(api, Arc::new(FakeConnector::default()));
    client.load_conversations(&ConversationFilters::default()).await.expect("page");

    client.close_conversation("c1");

    assert!(client.state().read(|store| store.conversation("c1").is_none()));
}

#[tokio::test]
async fn extra_handlers_see_typed_events() {
    struct Kinds(Mutex<Vec<&'static str>>);
    impl EventHandler for Kinds {
        fn handle(&self, event: &crate::dispatch::DomainEvent) {
            self.0.lock().expect("lock").push(event.kind());
        }
    }

    let client = client(Arc::new(PageApi::default()), Arc::new(FakeConnector::default()));
    let kinds = Arc::new(Kinds(Mutex::new(Vec::new())));
    client.register_handler(kinds.clone());

    let sink = ClientSink {
        state: client.state.clone(),
        api: Arc::clone(&client.api),
        dispatcher: Arc::clone(&client.dispatcher),
    };
    sink.on_raw("org-1", message_received("evt-1", "c1", "m1", 100));

    assert_eq!(kinds.0.lock().expect("lock").len(), 1);
    assert_eq!(client.state().read(|store| store.messages("c1").len()), 1);
}
