use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use capreplay_sync::{spawn_notification_loop, FenceError, FenceId, FenceReady, FenceRegistry};
use pretty_assertions::assert_eq;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[test]
fn loop_delivers_in_arrival_order_and_exits_when_channel_closes() {
    init_logging();

    let registry = Arc::new(FenceRegistry::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    for fence in [FenceId(0), FenceId(5), FenceId::STOP] {
        let order = Arc::clone(&order);
        registry
            .register(fence, move |ready| order.lock().unwrap().push(ready.fence))
            .unwrap();
    }

    let (tx, rx) = mpsc::channel();
    let handle = spawn_notification_loop(Arc::clone(&registry), rx).unwrap();
    tx.send(FenceReady { fence: FenceId(0) }).unwrap();
    tx.send(FenceReady { fence: FenceId(5) }).unwrap();
    tx.send(FenceReady { fence: FenceId::STOP }).unwrap();
    drop(tx);

    handle.join().unwrap().unwrap();
    assert_eq!(
        *order.lock().unwrap(),
        vec![FenceId(0), FenceId(5), FenceId::STOP]
    );
    assert_eq!(registry.outstanding(), 0);
}

#[test]
fn loop_stops_on_unknown_fence() {
    init_logging();

    let registry = Arc::new(FenceRegistry::new());
    let calls = Arc::new(AtomicU32::new(0));
    {
        let calls = Arc::clone(&calls);
        registry
            .register(FenceId(1), move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    let (tx, rx) = mpsc::channel();
    let handle = spawn_notification_loop(Arc::clone(&registry), rx).unwrap();
    tx.send(FenceReady { fence: FenceId(2) }).unwrap();
    // Never delivered: the loop has already failed on fence 2.
    let _ = tx.send(FenceReady { fence: FenceId(1) });

    assert_eq!(
        handle.join().unwrap(),
        Err(FenceError::UnknownFence(FenceId(2)))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(registry.is_registered(FenceId(1)));
}
