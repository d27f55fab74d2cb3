//! Backend-agnostic store scenarios, run against both backends.

use std::borrow::Cow;

use runnel::{token, ConsumerGroup, Message, WriteMessage, CORRELATION_KEY};
use runnel_store::{
    transfer, AppendOptions, Error, GetCategoryOptions, GetStreamOptions, MessageStore, Namespace,
    NewNamespace, SubscriptionBus, SubscriptionFilter,
};
use serde_json::json;

pub async fn create_namespace(store: &dyn MessageStore, id: &str) -> Namespace {
    let bearer = token::generate(id).unwrap();
    store
        .create_namespace(NewNamespace {
            id: id.to_string(),
            token_hash: token::hash(&bearer),
            description: format!("{id} namespace"),
            metadata: None,
        })
        .await
        .unwrap()
}

pub fn event(msg_type: &str, data: serde_json::Value) -> WriteMessage<'static> {
    WriteMessage {
        id: None,
        msg_type: Cow::Owned(msg_type.to_string()),
        data: Cow::Owned(data),
        metadata: None,
        time: None,
    }
}

async fn read_stream(store: &dyn MessageStore, ns: &str, stream: &str) -> Vec<Message<'static>> {
    store
        .stream_messages(ns, stream, GetStreamOptions::default())
        .await
        .unwrap()
}

pub async fn append_and_read_single_stream(store: &dyn MessageStore) {
    create_namespace(store, "acct").await;

    let first = store
        .append_to_stream(
            "acct",
            "account-123",
            event("Deposited", json!({"amount": 100})),
            AppendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((first.position, first.global_position), (0, 0));

    let second = store
        .append_to_stream(
            "acct",
            "account-123",
            event("Deposited", json!({"amount": 50})),
            AppendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!((second.position, second.global_position), (1, 1));

    assert_eq!(
        store.stream_version("acct", "account-123").await.unwrap(),
        Some(1)
    );

    let messages = read_stream(store, "acct", "account-123").await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].position, 0);
    assert_eq!(messages[0].msg_type, "Deposited");
    assert_eq!(*messages[0].data, json!({"amount": 100}));
    assert_eq!(messages[1].position, 1);
    assert_eq!(*messages[1].data, json!({"amount": 50}));
}

pub async fn optimistic_concurrency(store: &dyn MessageStore) {
    create_namespace(store, "occ").await;

    let opts = |expected| AppendOptions {
        expected_version: Some(expected),
    };

    let first = store
        .append_to_stream("occ", "order-42", event("Placed", json!({})), opts(-1))
        .await
        .unwrap();
    assert_eq!(first.position, 0);

    let conflict = store
        .append_to_stream("occ", "order-42", event("Placed", json!({})), opts(-1))
        .await;
    assert!(matches!(conflict, Err(Error::WrongExpectedVersion { .. })));
    assert_eq!(store.stream_version("occ", "order-42").await.unwrap(), Some(0));

    let conflict = store
        .append_to_stream("occ", "order-42", event("Shipped", json!({})), opts(5))
        .await;
    assert!(matches!(conflict, Err(Error::WrongExpectedVersion { .. })));

    let second = store
        .append_to_stream("occ", "order-42", event("Shipped", json!({})), opts(0))
        .await
        .unwrap();
    assert_eq!(second.position, 1);
}

pub async fn duplicate_id_is_rejected_without_burning_positions(store: &dyn MessageStore) {
    create_namespace(store, "dup").await;

    let id = uuid::Uuid::new_v4();
    let with_id = || WriteMessage {
        id: Some(id),
        ..event("Registered", json!({"user": "u-1"}))
    };

    let first = store
        .append_to_stream("dup", "user-1", with_id(), AppendOptions::default())
        .await
        .unwrap();
    assert_eq!(first.global_position, 0);

    let duplicate = store
        .append_to_stream("dup", "user-1", with_id(), AppendOptions::default())
        .await;
    assert!(matches!(duplicate, Err(Error::DuplicateId { .. })));
    assert_eq!(store.stream_version("dup", "user-1").await.unwrap(), Some(0));

    // The failed attempt must not consume a global position.
    let next = store
        .append_to_stream(
            "dup",
            "user-2",
            event("Registered", json!({})),
            AppendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(next.global_position, 1);
}

pub async fn gapless_positions(store: &dyn MessageStore) {
    create_namespace(store, "gapless").await;

    for round in 0..3u64 {
        for stream in ["account-1", "account-2"] {
            store
                .append_to_stream(
                    "gapless",
                    stream,
                    event("Ticked", json!({ "round": round })),
                    AppendOptions::default(),
                )
                .await
                .unwrap();
        }
    }

    let all = store
        .category_messages("gapless", "", GetCategoryOptions::default())
        .await
        .unwrap();
    let global: Vec<u64> = all.iter().map(|m| m.global_position).collect();
    assert_eq!(global, vec![0, 1, 2, 3, 4, 5]);

    for stream in ["account-1", "account-2"] {
        let positions: Vec<u64> = read_stream(store, "gapless", stream)
            .await
            .iter()
            .map(|m| m.position)
            .collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }
}

pub async fn category_consumer_groups(store: &dyn MessageStore) {
    create_namespace(store, "groups").await;

    for stream in ["user-1", "user-2", "user-3", "user-4"] {
        store
            .append_to_stream(
                "groups",
                stream,
                event("Signed", json!({})),
                AppendOptions::default(),
            )
            .await
            .unwrap();
    }

    let read_member = |member| {
        let group = ConsumerGroup::new(member, 2).unwrap();
        store.category_messages(
            "groups",
            "user",
            GetCategoryOptions {
                consumer_group: Some(group),
                ..Default::default()
            },
        )
    };

    let first = read_member(0).await.unwrap();
    let second = read_member(1).await.unwrap();

    let mut all: Vec<u64> = first
        .iter()
        .chain(second.iter())
        .map(|m| m.global_position)
        .collect();
    all.sort_unstable();
    assert_eq!(all, vec![0, 1, 2, 3], "members must cover all messages exactly once");
}

pub async fn correlation_filter(store: &dyn MessageStore) {
    create_namespace(store, "corr").await;

    let correlated = WriteMessage {
        metadata: Some(Cow::Owned(json!({ CORRELATION_KEY: "workflow-abc" }))),
        ..event("Step", json!({"n": 1}))
    };
    store
        .append_to_stream("corr", "order-1", correlated, AppendOptions::default())
        .await
        .unwrap();
    store
        .append_to_stream(
            "corr",
            "order-1",
            event("Step", json!({"n": 2})),
            AppendOptions::default(),
        )
        .await
        .unwrap();

    let messages = store
        .category_messages(
            "corr",
            "order",
            GetCategoryOptions {
                correlation: Some("workflow".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].correlation_stream_name(), Some("workflow-abc"));
}

pub async fn namespace_isolation(store: &dyn MessageStore) {
    create_namespace(store, "iso-a").await;
    create_namespace(store, "iso-b").await;

    store
        .append_to_stream(
            "iso-a",
            "stream-x",
            event("Secret", json!({})),
            AppendOptions::default(),
        )
        .await
        .unwrap();

    assert!(read_stream(store, "iso-b", "stream-x").await.is_empty());
    assert_eq!(store.stream_version("iso-b", "stream-x").await.unwrap(), None);
    assert_eq!(read_stream(store, "iso-a", "stream-x").await.len(), 1);
}

pub async fn last_message_and_type_filter(store: &dyn MessageStore) {
    create_namespace(store, "last").await;

    for (msg_type, n) in [("Opened", 0), ("Deposited", 1), ("Opened", 2)] {
        store
            .append_to_stream(
                "last",
                "account-9",
                event(msg_type, json!({ "n": n })),
                AppendOptions::default(),
            )
            .await
            .unwrap();
    }

    let last = store
        .last_stream_message("last", "account-9", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((last.position, last.msg_type.as_ref()), (2, "Opened"));

    let last_deposit = store
        .last_stream_message("last", "account-9", Some("Deposited"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last_deposit.position, 1);

    assert!(store
        .last_stream_message("last", "account-9", Some("Closed"))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .last_stream_message("last", "account-none", None)
        .await
        .unwrap()
        .is_none());
}

pub async fn read_windows(store: &dyn MessageStore) {
    create_namespace(store, "windows").await;

    for n in 0..5 {
        store
            .append_to_stream(
                "windows",
                "log-1",
                event("Line", json!({ "n": n })),
                AppendOptions::default(),
            )
            .await
            .unwrap();
    }

    let from_two = store
        .stream_messages(
            "windows",
            "log-1",
            GetStreamOptions {
                position: 2,
                batch_size: 2,
            },
        )
        .await
        .unwrap();
    let positions: Vec<u64> = from_two.iter().map(|m| m.position).collect();
    assert_eq!(positions, vec![2, 3]);

    let none = store
        .stream_messages(
            "windows",
            "log-1",
            GetStreamOptions {
                position: 0,
                batch_size: 0,
            },
        )
        .await
        .unwrap();
    assert!(none.is_empty());

    let unbounded = store
        .stream_messages(
            "windows",
            "log-1",
            GetStreamOptions {
                position: 0,
                batch_size: -1,
            },
        )
        .await
        .unwrap();
    assert_eq!(unbounded.len(), 5);

    let tail = store
        .category_messages(
            "windows",
            "log",
            GetCategoryOptions {
                position: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let global: Vec<u64> = tail.iter().map(|m| m.global_position).collect();
    assert_eq!(global, vec![3, 4]);
}

pub async fn registry_lifecycle(store: &dyn MessageStore) {
    let created = create_namespace(store, "reg-a").await;

    let dup_id = store
        .create_namespace(NewNamespace {
            id: "reg-a".to_string(),
            token_hash: "0".repeat(64),
            description: String::new(),
            metadata: None,
        })
        .await;
    assert!(matches!(dup_id, Err(Error::NamespaceExists { .. })));

    let dup_hash = store
        .create_namespace(NewNamespace {
            id: "reg-b".to_string(),
            token_hash: created.token_hash.clone(),
            description: String::new(),
            metadata: None,
        })
        .await;
    assert!(matches!(dup_hash, Err(Error::NamespaceExists { .. })));

    let by_hash = store
        .namespace_by_token_hash(&created.token_hash)
        .await
        .unwrap();
    assert_eq!(by_hash.id, "reg-a");

    assert!(store
        .namespaces()
        .await
        .unwrap()
        .iter()
        .any(|ns| ns.id == "reg-a"));

    store
        .append_to_stream(
            "reg-a",
            "account-1",
            event("Opened", json!({})),
            AppendOptions::default(),
        )
        .await
        .unwrap();
    let stats = store.namespace_stats("reg-a").await.unwrap();
    assert_eq!((stats.message_count, stats.stream_count), (1, 1));
    assert!(stats.last_activity.is_some());

    let deleted = store.delete_namespace("reg-a").await.unwrap();
    assert_eq!(deleted, 1);

    assert!(matches!(
        store.namespace("reg-a").await,
        Err(Error::NamespaceNotFound { .. })
    ));
    assert!(matches!(
        store.delete_namespace("reg-a").await,
        Err(Error::NamespaceNotFound { .. })
    ));
    assert!(matches!(
        store.namespace_by_token_hash(&created.token_hash).await,
        Err(Error::UnknownToken)
    ));
    assert!(matches!(
        store
            .append_to_stream(
                "reg-a",
                "account-1",
                event("Opened", json!({})),
                AppendOptions::default(),
            )
            .await,
        Err(Error::NamespaceNotFound { .. })
    ));
}

pub async fn pokes_follow_commits(store: &dyn MessageStore, bus: &SubscriptionBus) {
    create_namespace(store, "pokes").await;

    let mut all = bus.subscribe(
        "pokes",
        SubscriptionFilter::Category {
            category: String::new(),
            correlation: None,
            consumer_group: None,
        },
    );
    let mut one_stream = bus.subscribe(
        "pokes",
        SubscriptionFilter::Stream {
            stream_name: "account-1".to_string(),
        },
    );

    store
        .append_to_stream(
            "pokes",
            "account-1",
            event("Opened", json!({})),
            AppendOptions::default(),
        )
        .await
        .unwrap();
    store
        .append_to_stream(
            "pokes",
            "account-2",
            event("Opened", json!({})),
            AppendOptions::default(),
        )
        .await
        .unwrap();

    let poke = all.recv().await.unwrap();
    assert_eq!(poke.stream_name, "account-1");
    assert_eq!(poke.category, "account");
    assert_eq!((poke.position, poke.global_position), (0, 0));

    // A read performed after the poke observes the poked message.
    let seen = store
        .category_messages(
            "pokes",
            "",
            GetCategoryOptions {
                position: poke.global_position,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(seen[0].global_position, poke.global_position);

    assert_eq!(all.recv().await.unwrap().global_position, 1);

    // The stream subscriber only sees its own stream.
    let poke = one_stream.recv().await.unwrap();
    assert_eq!(poke.stream_name, "account-1");
}

pub async fn transfer_round_trip(store: &dyn MessageStore) {
    create_namespace(store, "xfer-src").await;
    create_namespace(store, "xfer-dst").await;

    let correlated = WriteMessage {
        metadata: Some(Cow::Owned(json!({ CORRELATION_KEY: "workflow-7" }))),
        ..event("Step", json!({"n": 0}))
    };
    store
        .append_to_stream("xfer-src", "job-1", correlated, AppendOptions::default())
        .await
        .unwrap();
    for n in 1..3 {
        store
            .append_to_stream(
                "xfer-src",
                "job-2",
                event("Step", json!({ "n": n })),
                AppendOptions::default(),
            )
            .await
            .unwrap();
    }

    let mut buffer = Vec::new();
    let exported = transfer::export(store, "xfer-src", &mut buffer).await.unwrap();
    assert_eq!(exported, 3);

    let summary = transfer::import(store, "xfer-dst", buffer.as_slice())
        .await
        .unwrap();
    assert_eq!((summary.imported, summary.skipped), (3, 0));

    let source = store
        .category_messages("xfer-src", "", GetCategoryOptions::default())
        .await
        .unwrap();
    let copied = store
        .category_messages("xfer-dst", "", GetCategoryOptions::default())
        .await
        .unwrap();
    assert_eq!(source.len(), copied.len());
    for (a, b) in source.iter().zip(copied.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.stream_name, b.stream_name);
        assert_eq!(a.msg_type, b.msg_type);
        assert_eq!(a.data, b.data);
        assert_eq!(a.metadata, b.metadata);
        assert_eq!(a.time, b.time);
        assert_eq!(a.global_position, b.global_position);
    }

    // Importing the same records again is a no-op.
    let again = transfer::import(store, "xfer-dst", buffer.as_slice())
        .await
        .unwrap();
    assert_eq!((again.imported, again.skipped), (0, 3));
}
