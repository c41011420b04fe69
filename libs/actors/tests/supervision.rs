//! Supervision: restart from the initial state, restart intensity,
//! escalation through parents, and parent-exit behavior of children.

mod common;

use common::*;
use oscar::{ActorError, LifecycleEvent, OnParentExit, RestartPolicy, SpawnOptions};

#[tokio::test]
async fn test_restart_restores_initial_state_and_keeps_mailbox() {
    let system = local_system();
    let counter = system
        .spawn("main", Counter::starting_at(10), RestartPolicy::Restart)
        .await
        .unwrap();
    let mut events = subscribed(system.watch(&counter));

    assert_eq!(add(&system, &counter, 5).await.unwrap(), 15);

    // Messages queued behind the failure survive the restart
    system.tell_typed(&counter, &Command::Sleep(50)).await.unwrap();
    system.tell_typed(&counter, &Command::Add(1)).await.unwrap();
    system.tell_typed(&counter, &Command::Fail).await.unwrap();
    system.tell_typed(&counter, &Command::Add(2)).await.unwrap();

    assert_eq!(total(&system, &counter).await.unwrap(), 12);
    assert_eq!(next_event(&mut events).await, Some(LifecycleEvent::Restarted));

    let stats = system.pool_stats("main").unwrap();
    assert_eq!(stats.handler_failures, 1);
    assert_eq!(stats.actor_restarts, 1);
    system.shutdown().await;
}

#[tokio::test]
async fn test_failed_call_gets_handler_failure() {
    let system = local_system();
    let counter = system.spawn("main", Counter::default(), RestartPolicy::Restart).await.unwrap();

    let err = system.call(&counter, command(&Command::Fail), CALL_TIMEOUT).await.unwrap_err();
    match err {
        ActorError::HandlerFailure(message) => assert!(message.contains("requested failure")),
        other => panic!("expected HandlerFailure, got {:?}", other),
    }
    assert_eq!(add(&system, &counter, 1).await.unwrap(), 1);
    system.shutdown().await;
}

#[tokio::test]
async fn test_panic_is_contained_and_stop_policy_removes_actor() {
    let system = local_system();
    let actor = Counter::default();
    let counter = system.spawn("main", actor.clone(), RestartPolicy::Stop).await.unwrap();
    let mut events = subscribed(system.watch(&counter));

    let err = system.call(&counter, command(&Command::Panic), CALL_TIMEOUT).await.unwrap_err();
    match err {
        ActorError::HandlerFailure(message) => assert!(message.contains("requested panic")),
        other => panic!("expected HandlerFailure, got {:?}", other),
    }

    assert_eq!(next_event(&mut events).await, Some(LifecycleEvent::Stopped));
    assert!(!system.has_actor(&counter));
    assert!(matches!(total(&system, &counter).await, Err(ActorError::RoutingFailure(_))));
    assert_eq!(actor.stop_count(), 1);

    // Other actors on the same workers keep running
    let other = system.spawn("main", Counter::default(), RestartPolicy::Stop).await.unwrap();
    assert_eq!(add(&system, &other, 3).await.unwrap(), 3);
    system.shutdown().await;
}

#[tokio::test]
async fn test_restart_intensity_exceeded_stops_actor() {
    let system = local_system();
    let counter = system.spawn("main", Counter::default(), RestartPolicy::Restart).await.unwrap();
    let mut events = subscribed(system.watch(&counter));

    // Default limit: 3 restarts per window
    for _ in 0..3 {
        assert!(system.call(&counter, command(&Command::Fail), CALL_TIMEOUT).await.is_err());
        assert_eq!(next_event(&mut events).await, Some(LifecycleEvent::Restarted));
    }
    assert!(system.call(&counter, command(&Command::Fail), CALL_TIMEOUT).await.is_err());
    assert_eq!(next_event(&mut events).await, Some(LifecycleEvent::Stopped));
    assert!(!system.has_actor(&counter));
    system.shutdown().await;
}

#[tokio::test]
async fn test_escalation_restarts_parent_and_following_children() {
    let system = local_system();
    let parent = system
        .spawn("main", Counter::starting_at(100), RestartPolicy::Restart)
        .await
        .unwrap();
    let escalating = system
        .spawn_with(
            "main",
            Counter::default(),
            SpawnOptions::with_policy(RestartPolicy::Escalate).parent(parent.uid().clone()),
        )
        .await
        .unwrap();
    let detached = system
        .spawn_with(
            "main",
            Counter::default(),
            SpawnOptions::with_policy(RestartPolicy::Stop)
                .parent(parent.uid().clone())
                .on_parent_exit(OnParentExit::Detach),
        )
        .await
        .unwrap();

    assert_eq!(add(&system, &parent, 5).await.unwrap(), 105);
    assert_eq!(add(&system, &escalating, 6).await.unwrap(), 6);
    assert_eq!(add(&system, &detached, 7).await.unwrap(), 7);

    let mut parent_events = subscribed(system.watch(&parent));
    let mut child_events = subscribed(system.watch(&escalating));
    assert!(system.call(&escalating, command(&Command::Fail), CALL_TIMEOUT).await.is_err());

    assert_eq!(next_event(&mut parent_events).await, Some(LifecycleEvent::Restarted));
    assert_eq!(next_event(&mut child_events).await, Some(LifecycleEvent::Restarted));
    assert_eq!(total(&system, &parent).await.unwrap(), 100);
    assert_eq!(total(&system, &escalating).await.unwrap(), 0);

    // The detached child kept its state and now sits at the pool root
    assert_eq!(total(&system, &detached).await.unwrap(), 7);
    let stats = system.pool_stats("main").unwrap();
    assert_eq!(stats.actors, 3);
    system.shutdown().await;
}

#[tokio::test]
async fn test_escalating_root_actor_is_stopped() {
    let system = local_system();
    let counter = system.spawn("main", Counter::default(), RestartPolicy::Escalate).await.unwrap();
    let mut events = subscribed(system.watch(&counter));

    assert!(system.call(&counter, command(&Command::Fail), CALL_TIMEOUT).await.is_err());
    assert_eq!(next_event(&mut events).await, Some(LifecycleEvent::Stopped));
    assert!(!system.has_actor(&counter));
    system.shutdown().await;
}

#[tokio::test]
async fn test_stopping_parent_stops_following_children() {
    let system = local_system();
    let parent = system.spawn("main", Counter::default(), RestartPolicy::Stop).await.unwrap();
    let child_actor = Counter::default();
    let child = system
        .spawn_with(
            "main",
            child_actor.clone(),
            SpawnOptions::default().parent(parent.uid().clone()),
        )
        .await
        .unwrap();
    let grandchild = system
        .spawn_with(
            "main",
            Counter::default(),
            SpawnOptions::default().parent(child.uid().clone()),
        )
        .await
        .unwrap();
    let survivor = system
        .spawn_with(
            "main",
            Counter::default(),
            SpawnOptions::default()
                .parent(parent.uid().clone())
                .on_parent_exit(OnParentExit::Detach),
        )
        .await
        .unwrap();

    system.stop(&parent).await.unwrap();
    assert!(!system.has_actor(&parent));
    assert!(!system.has_actor(&child));
    assert!(!system.has_actor(&grandchild));
    assert!(system.has_actor(&survivor));
    assert_eq!(child_actor.stop_count(), 1);
    assert_eq!(add(&system, &survivor, 1).await.unwrap(), 1);
    system.shutdown().await;
}

#[tokio::test]
async fn test_unknown_parent_is_rejected() {
    let system = local_system();
    let err = system
        .spawn_with(
            "main",
            Counter::default(),
            SpawnOptions::default().parent(oscar::ActorUid::new("nobody")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ActorError::Rejected(_)));
    system.shutdown().await;
}
