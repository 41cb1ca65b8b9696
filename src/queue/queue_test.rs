use super::*;
use crate::event::FLAG_ACK;

fn local_event(typ: EventType, stream_id: u32) -> Event {
    Event::new(typ, stream_id, 0, 0)
}

#[test]
fn test_enqueue_and_process_in_order() -> Result<()> {
    let mut q = EventQueue::new();
    let a = q.enqueue(local_event(EventType::WriteReq, 1), EventOrigin::Local, None)?;
    let b = q.enqueue(local_event(EventType::ReadReq, 1), EventOrigin::Local, None)?;

    assert_eq!(q.next_to_process(), Some(a));
    assert_eq!(q.next_to_process(), Some(b));
    assert_eq!(q.next_to_process(), None);
    Ok(())
}

#[test]
fn test_queue_full() -> Result<()> {
    let mut q = EventQueue::new();
    for _ in 0..MAX_EVENTS {
        q.enqueue(local_event(EventType::PingReq, 0), EventOrigin::Local, None)?;
    }
    assert_eq!(
        q.enqueue(local_event(EventType::PingReq, 0), EventOrigin::Local, None)
            .unwrap_err(),
        Error::ErrEventQueueFull
    );

    // serving one slot makes room again
    q.post_and_mark_served(0, None, None);
    q.enqueue(local_event(EventType::PingReq, 0), EventOrigin::Local, None)?;
    Ok(())
}

#[tokio::test]
async fn test_completion_posts_result() -> Result<()> {
    let mut q = EventQueue::new();
    let (tx, rx) = oneshot::channel();
    let mut ev = local_event(EventType::WriteReq, 3);
    ev.header.flags.acknowledge();
    let idx = q.enqueue(ev, EventOrigin::Local, Some(tx))?;

    q.post_and_mark_served(idx, None, None);
    let result = rx.await.expect("completion");
    assert!(result.header.flags.contains(FLAG_ACK));
    assert_eq!(result.header.stream_id, 3);
    assert_eq!(q.count_state(EventState::Served), MAX_EVENTS);
    Ok(())
}

#[test]
fn test_blocked_ready_retry_order() -> Result<()> {
    let mut q = EventQueue::new();
    let blocked = q.enqueue(local_event(EventType::WriteReq, 7), EventOrigin::Local, None)?;
    q.slot(blocked).state = EventState::Blocked;
    let fresh = q.enqueue(local_event(EventType::WriteReq, 7), EventOrigin::Local, None)?;

    assert_eq!(q.search_ready(), None);
    assert!(q.unblock(None, EventType::WriteReq, 7));

    // the unblocked event is found before fresh allocations
    assert_eq!(q.search_ready(), Some(blocked));
    assert_eq!(q.next_to_process(), Some(fresh));
    Ok(())
}

#[test]
fn test_unblock_matches_type_and_stream() -> Result<()> {
    let mut q = EventQueue::new();
    let idx = q.enqueue(local_event(EventType::WriteReq, 5), EventOrigin::Local, None)?;
    q.slot(idx).state = EventState::Blocked;

    assert!(!q.unblock(None, EventType::ReadReq, 5));
    assert!(!q.unblock(None, EventType::WriteReq, 6));
    assert!(q.unblock(None, EventType::WriteReq, 5));
    Ok(())
}

#[tokio::test]
async fn test_serve_drops_completer_silently() -> Result<()> {
    let mut q = EventQueue::new();
    let (tx, rx) = oneshot::channel();
    let ev = local_event(EventType::ReadReq, 2);
    let id = ev.header.id;
    let idx = q.enqueue(ev, EventOrigin::Local, Some(tx))?;
    q.slot(idx).state = EventState::Blocked;

    assert!(q.serve(Some(id), EventType::ReadReq, 2));
    assert_eq!(q.slot(idx).state, EventState::Served);
    // the abandoned caller is never woken
    assert!(rx.await.is_err());
    Ok(())
}

#[test]
fn test_serve_or_drop_blocked_write_is_served() -> Result<()> {
    let mut q = EventQueue::new();
    let ev = local_event(EventType::WriteReq, 4);
    let id = ev.header.id;
    let idx = q.enqueue(ev, EventOrigin::Local, None)?;
    q.slot(idx).state = EventState::Blocked;

    q.serve_or_drop(Some(id), EventType::WriteReq, 4);
    assert_eq!(q.slot(idx).state, EventState::Served);
    assert!(!q.slot(idx).event.header.flags.contains(FLAG_DROPPED));
    Ok(())
}

#[test]
fn test_serve_or_drop_pending_write_is_dropped() -> Result<()> {
    let mut q = EventQueue::new();
    let ev = local_event(EventType::WriteReq, 4);
    let id = ev.header.id;
    let idx = q.enqueue(ev, EventOrigin::Local, None)?;
    q.slot(idx).state = EventState::Pending;

    q.serve_or_drop(Some(id), EventType::WriteReq, 4);
    assert_eq!(q.slot(idx).state, EventState::Dropped);
    assert!(q.slot(idx).event.header.flags.contains(FLAG_DROPPED));

    // the late response still finds a landing slot
    assert_eq!(q.find_response_target(id, EventType::WriteResp), Some(idx));
    q.post_and_mark_served(idx, None, None);
    assert_eq!(q.slot(idx).state, EventState::Served);
    Ok(())
}

#[test]
fn test_response_matching_requires_id_and_type() -> Result<()> {
    let mut q = EventQueue::new();
    let ev = local_event(EventType::CreateStreamReq, 0);
    let id = ev.header.id;
    let idx = q.enqueue(ev, EventOrigin::Local, None)?;
    q.slot(idx).state = EventState::Pending;

    assert_eq!(q.find_response_target(id, EventType::WriteResp), None);
    assert_eq!(q.find_response_target(id + 1, EventType::CreateStreamResp), None);
    assert_eq!(
        q.find_response_target(id, EventType::CreateStreamResp),
        Some(idx)
    );
    Ok(())
}

#[tokio::test]
async fn test_free_with_state_completes_with_error() -> Result<()> {
    let mut q = EventQueue::new();
    let (tx1, rx1) = oneshot::channel();
    let (tx2, rx2) = oneshot::channel();
    let a = q.enqueue(local_event(EventType::WriteReq, 1), EventOrigin::Local, Some(tx1))?;
    let b = q.enqueue(local_event(EventType::ReadReq, 1), EventOrigin::Local, Some(tx2))?;
    q.slot(a).state = EventState::Pending;
    q.slot(b).state = EventState::Blocked;

    assert_eq!(q.free_with_state(EventState::Pending, Error::ErrCommunicationFail), 1);
    assert_eq!(q.free_with_state(EventState::Blocked, Error::ErrCommunicationFail), 1);

    assert_eq!(rx1.await.expect("pending").error, Some(Error::ErrCommunicationFail));
    assert_eq!(rx2.await.expect("blocked").error, Some(Error::ErrCommunicationFail));
    Ok(())
}
