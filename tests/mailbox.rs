use std::sync::Arc;
use std::time::Duration;

use secret_committee::mailbox::Mailbox;
use secret_committee::store::{MemoryStore, Store};
use secret_committee::types::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn store() -> Arc<dyn Store> {
    Arc::new(MemoryStore::new())
}

async fn next(rx: &mut mpsc::UnboundedReceiver<u32>) -> u32 {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler ran")
        .expect("channel open")
}

#[tokio::test]
async fn handles_items_in_order() {
    let mailbox: Mailbox<u32> = Mailbox::new(store(), "dkg", "inbox");
    let (tx, mut rx) = mpsc::unbounded_channel();
    mailbox.start(move |item| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(item);
            Ok(())
        }
    });
    for item in 1..=5 {
        mailbox.push(item).expect("push");
    }
    for expected in 1..=5 {
        assert_eq!(next(&mut rx).await, expected);
    }
    assert!(mailbox.is_empty().expect("len"));
}

#[tokio::test]
async fn replays_pending_items_after_restart() {
    let store = store();
    {
        let before: Mailbox<u32> = Mailbox::new(store.clone(), "dkg", "inbox");
        before.push(7).expect("push");
        before.push(8).expect("push");
        assert_eq!(before.len().expect("len"), 2);
    }

    let after: Mailbox<u32> = Mailbox::new(store, "dkg", "inbox");
    assert_eq!(after.pending().expect("pending"), vec![7, 8]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    after.start(move |item| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(item);
            Ok(())
        }
    });
    assert_eq!(next(&mut rx).await, 7);
    assert_eq!(next(&mut rx).await, 8);
}

#[tokio::test]
async fn mailboxes_are_isolated_by_key() {
    let store = store();
    let a: Mailbox<u32> = Mailbox::new(store.clone(), "dkg", "a");
    let b: Mailbox<u32> = Mailbox::new(store, "dkg", "b");
    a.push(1).expect("push");
    assert_eq!(a.pop().expect("pop"), Some(1));
    assert_eq!(b.pop().expect("pop"), None);
}

// Removal is persisted before the handler runs, so a failing handler loses
// the item rather than retrying it.
#[tokio::test]
async fn failed_item_is_not_redelivered() {
    let store = store();
    let mailbox: Mailbox<u32> = Mailbox::new(store.clone(), "dkg", "inbox");
    let (tx, mut rx) = mpsc::unbounded_channel();
    mailbox.start(move |item| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(item);
            if item == 1 {
                return Err(Error::InvalidMessage("rejected".into()));
            }
            Ok(())
        }
    });
    mailbox.push(1).expect("push");
    mailbox.push(2).expect("push");
    assert_eq!(next(&mut rx).await, 1);
    assert_eq!(next(&mut rx).await, 2);
    mailbox.stop();

    let reopened: Mailbox<u32> = Mailbox::new(store, "dkg", "inbox");
    assert!(reopened.is_empty().expect("len"));
}
