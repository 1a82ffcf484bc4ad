//! Property-based tests for the chat analytics queries
//!
//! Uses proptest to check the ordering and counting guarantees of the public
//! timeline, the most active sender and the private thread over randomly
//! generated conversations.
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use charla::chat::{
    Chat, ChatStore, Content, Message, Participant, PrivateThreadEntry, SenderActivity,
    TimelineEntry,
};
use charla::Config;

const CHAT: &str = "sala";
const ALIASES: [&str; 4] = ["Ana", "Leo", "Seba", "Vale"];

// ============================================================================
// Test Strategies
// ============================================================================

#[derive(Debug, Clone)]
struct Draft {
    sender: usize,
    recipient: Option<usize>,
    timestamp: i64,
    likers: Vec<usize>,
}

/// Strategy for one message: sender, optional recipient, time and likers
fn draft_strategy() -> impl Strategy<Value = Draft> {
    (
        0..ALIASES.len(),
        prop::option::of(0..ALIASES.len()),
        0i64..40,
        prop::collection::btree_set(0..ALIASES.len(), 0..=ALIASES.len()),
    )
        .prop_map(|(sender, recipient, timestamp, likers)| Draft {
            sender,
            // Private messages go to someone else
            recipient: recipient.map(|r| if r == sender { (r + 1) % ALIASES.len() } else { r }),
            timestamp,
            likers: likers.into_iter().collect(),
        })
}

fn conversation_strategy() -> impl Strategy<Value = Vec<Draft>> {
    prop::collection::vec(draft_strategy(), 0..24)
}

struct Results {
    timeline: Vec<TimelineEntry>,
    top: Option<SenderActivity>,
    threads: Vec<(String, Vec<PrivateThreadEntry>)>,
}

fn run_conversation(drafts: &[Draft]) -> Results {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let store = ChatStore::open(&Config::default()).await.unwrap();
        let start = Utc.timestamp_millis_opt(0).unwrap();
        let mut chat = Chat::new(CHAT, start);
        for alias in ALIASES {
            chat = chat.with_participant(Participant::new(alias, start));
        }
        store.create_chat(&chat).await.unwrap();

        for (i, draft) in drafts.iter().enumerate() {
            let id = format!("m{:02}", i);
            let at = Utc.timestamp_millis_opt(draft.timestamp).unwrap();
            let content = Content::text(format!("mensaje {}", i));
            let message = match draft.recipient {
                Some(r) => Message::private(CHAT, ALIASES[draft.sender], ALIASES[r], at, content),
                None => Message::public(CHAT, ALIASES[draft.sender], at, content),
            };
            store.send_message(&message.with_id(id.clone())).await.unwrap();
            for liker in &draft.likers {
                store.like_message(&id, ALIASES[*liker]).await.unwrap();
            }
        }

        let analytics = store.analytics();
        let mut threads = Vec::new();
        for alias in ALIASES {
            threads.push((alias.to_string(), analytics.private_thread(CHAT, alias).await.unwrap()));
        }

        Results {
            timeline: analytics.public_timeline(CHAT).await.unwrap(),
            top: analytics.most_active_sender(CHAT).await.unwrap(),
            threads,
        }
    })
}

// ============================================================================
// Query Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The timeline holds every public message once, oldest first, with exact like counts
    #[test]
    fn prop_timeline_sorted_with_exact_counts(drafts in conversation_strategy()) {
        let results = run_conversation(&drafts);

        let sorted = results
            .timeline
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp);
        prop_assert!(sorted, "timeline out of order");

        let mut expected: Vec<(i64, String, u64)> = drafts
            .iter()
            .filter(|d| d.recipient.is_none())
            .map(|d| (d.timestamp, ALIASES[d.sender].to_string(), d.likers.len() as u64))
            .collect();
        let mut actual: Vec<(i64, String, u64)> = results
            .timeline
            .iter()
            .map(|e| (e.timestamp.timestamp_millis(), e.sender.clone(), e.like_count))
            .collect();
        expected.sort();
        actual.sort();
        prop_assert_eq!(actual, expected);
        let unreported = results.timeline.iter().all(|e| e.report_count == 0);
        prop_assert!(unreported, "timeline reports a message nobody reported");
    }

    /// No sender has strictly more messages than the reported one; ties go to the smallest alias
    #[test]
    fn prop_most_active_sender(drafts in conversation_strategy()) {
        let results = run_conversation(&drafts);

        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for draft in &drafts {
            *counts.entry(ALIASES[draft.sender]).or_default() += 1;
        }

        match results.top {
            None => prop_assert!(drafts.is_empty()),
            Some(top) => {
                let max = counts.values().copied().max().unwrap();
                prop_assert_eq!(counts.get(top.alias.as_str()).copied(), Some(top.message_count));
                prop_assert_eq!(top.message_count, max);
                // BTreeMap iterates aliases in order, so the first maximum is the smallest alias
                let first_max = counts.iter().find(|(_, c)| **c == max).map(|(a, _)| *a).unwrap();
                prop_assert_eq!(top.alias.as_str(), first_max);
            }
        }
    }

    /// The thread of X is exactly the private messages X sent or received, in order
    #[test]
    fn prop_private_thread_membership(drafts in conversation_strategy()) {
        let results = run_conversation(&drafts);

        for (alias, thread) in &results.threads {
            let sorted = thread.windows(2).all(|w| {
                (w[0].timestamp, &w[0].sender, &w[0].recipient)
                    <= (w[1].timestamp, &w[1].sender, &w[1].recipient)
            });
            prop_assert!(sorted, "thread of {} out of order", alias);

            let mut expected: Vec<(i64, String, String, u64)> = drafts
                .iter()
                .filter_map(|d| d.recipient.map(|r| (d, ALIASES[d.sender], ALIASES[r])))
                .filter(|(_, sender, recipient)| sender == alias || recipient == alias)
                .map(|(d, sender, recipient)| {
                    (d.timestamp, sender.to_string(), recipient.to_string(), d.likers.len() as u64)
                })
                .collect();
            let mut actual: Vec<(i64, String, String, u64)> = thread
                .iter()
                .map(|e| {
                    (
                        e.timestamp.timestamp_millis(),
                        e.sender.clone(),
                        e.recipient.clone(),
                        e.like_count,
                    )
                })
                .collect();
            expected.sort();
            actual.sort();
            prop_assert_eq!(actual, expected);
        }
    }
}
