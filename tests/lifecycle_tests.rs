//! Container lifecycle through the agent facade: allocation, creation,
//! failure recording, deletion, resynchronization, and reaping.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use stevedore::capacity::Resources;
use stevedore::constants::{CONTAINER_OWNER_PROPERTY, CONTAINER_STATE_PROPERTY};
use stevedore::container::ContainerState;
use stevedore::error::Error;
use stevedore::events::ContainerEvent;

use common::{container, start_agent, start_agent_with_runtime, test_config, FakeRuntime};

// =============================================================================
// Allocate / Initialize
// =============================================================================

#[tokio::test]
async fn allocate_initialize_creates_a_sandbox_with_properties() {
    let fixture = start_agent(test_config()).await;
    let agent = &fixture.agent;

    let mut request = container("guid-1");
    request
        .tags
        .insert("lifecycle".to_string(), "task".to_string());

    agent.allocate(request).unwrap();
    let created = agent.initialize("guid-1").await.unwrap();

    assert_eq!(created.state, ContainerState::Created);
    assert_eq!(created.internal_ip, "10.0.0.5");

    let sandbox = fixture.runtime.sandbox("guid-1").expect("sandbox exists");
    assert_eq!(
        sandbox.property(CONTAINER_OWNER_PROPERTY).as_deref(),
        Some("stevedore")
    );
    assert_eq!(
        sandbox.property(CONTAINER_STATE_PROPERTY).as_deref(),
        Some("created")
    );
    assert_eq!(
        sandbox.property("tag:lifecycle").as_deref(),
        Some("task")
    );
}

#[tokio::test]
async fn initialize_without_allocation_is_not_found() {
    let fixture = start_agent(test_config()).await;

    assert!(matches!(
        fixture.agent.initialize("ghost").await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn failed_create_records_failure_and_keeps_capacity_until_delete() {
    let fixture = start_agent(test_config()).await;
    let agent = &fixture.agent;
    let mut events = agent.subscribe().unwrap();

    fixture
        .runtime
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);

    agent.allocate(container("doomed")).unwrap();
    let before_delete = agent.remaining_resources();
    agent.initialize("doomed").await.unwrap_err();

    // Capacity is still held by the failed allocation.
    assert_eq!(agent.remaining_resources(), before_delete);

    let failed = agent.lookup("doomed").unwrap();
    assert!(failed.run_result.failed);
    assert!(failed.run_result.failure_reason.contains("quota exceeded"));

    assert!(matches!(
        events.recv().await.unwrap(),
        ContainerEvent::Reserved { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        ContainerEvent::InitializeFailed { .. }
    ));

    agent.delete("doomed").await.unwrap();
    assert_eq!(
        agent.remaining_resources(),
        Resources::new(1024, 1024, 10)
    );
}

// =============================================================================
// Delete / Destroy
// =============================================================================

#[tokio::test]
async fn delete_works_in_every_pre_runtime_state() {
    let fixture = start_agent(test_config()).await;
    let agent = &fixture.agent;

    agent.allocate(container("reserved")).unwrap();
    agent.delete("reserved").await.unwrap();
    assert!(matches!(
        agent.lookup("reserved").unwrap_err(),
        Error::NotFound(_)
    ));

    agent.allocate(container("created")).unwrap();
    agent.initialize("created").await.unwrap();
    agent.delete("created").await.unwrap();

    assert!(fixture.runtime.sandbox("created").is_none());
    assert_eq!(
        agent.remaining_resources(),
        Resources::new(1024, 1024, 10)
    );
}

#[tokio::test]
async fn destroy_tolerates_a_sandbox_the_runtime_already_lost() {
    let fixture = start_agent(test_config()).await;
    let agent = &fixture.agent;

    agent.allocate(container("vanishing")).unwrap();
    agent.initialize("vanishing").await.unwrap();

    // The runtime loses the sandbox behind the agent's back.
    fixture.runtime.sandboxes.lock().unwrap().remove("vanishing");

    agent.delete("vanishing").await.unwrap();
    assert!(matches!(
        agent.lookup("vanishing").unwrap_err(),
        Error::NotFound(_)
    ));
}

// =============================================================================
// Lookup / List
// =============================================================================

#[tokio::test]
async fn list_merges_both_stores_and_honors_tag_filters() {
    let fixture = start_agent(test_config()).await;
    let agent = &fixture.agent;

    let mut tagged = container("tagged");
    tagged.tags.insert("team".to_string(), "blue".to_string());
    agent.allocate(tagged).unwrap();

    let mut created = container("created");
    created.tags.insert("team".to_string(), "red".to_string());
    agent.allocate(created).unwrap();
    agent.initialize("created").await.unwrap();

    assert_eq!(agent.list(&Default::default()).len(), 2);

    let red: Vec<_> = agent
        .list(&[("team".to_string(), "red".to_string())].into_iter().collect())
        .into_iter()
        .map(|c| c.guid)
        .collect();
    assert_eq!(red, ["created"]);
}

#[tokio::test]
async fn get_files_streams_from_the_sandbox() {
    let fixture = start_agent(test_config()).await;
    let agent = &fixture.agent;

    agent.allocate(container("files")).unwrap();
    agent.initialize("files").await.unwrap();

    let sandbox = fixture.runtime.sandbox("files").unwrap();
    sandbox
        .stream_out_data
        .lock()
        .unwrap()
        .insert("/home/vcap/app.log".to_string(), b"log line\n".to_vec());

    let mut reader = agent.get_files("files", "/home/vcap/app.log").await.unwrap();
    let mut contents = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut contents)
        .await
        .unwrap();

    assert_eq!(contents, b"log line\n");
}

// =============================================================================
// Resynchronization
// =============================================================================

#[tokio::test]
async fn startup_destroys_only_containers_owned_by_this_agent() {
    let runtime = FakeRuntime::new();
    runtime.seed_sandbox(
        "orphan",
        HashMap::from([(CONTAINER_OWNER_PROPERTY.to_string(), "stevedore".to_string())]),
    );
    runtime.seed_sandbox(
        "foreign",
        HashMap::from([(CONTAINER_OWNER_PROPERTY.to_string(), "someone-else".to_string())]),
    );

    let fixture = start_agent_with_runtime(test_config(), runtime).await;

    assert!(fixture.runtime.sandbox("orphan").is_none());
    assert!(fixture.runtime.sandbox("foreign").is_some());
}

// =============================================================================
// Reaper
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reaper_removes_old_completed_containers() {
    let mut config = test_config();
    config.container_reap_interval = Duration::from_millis(50);
    let fixture = start_agent(config).await;
    let agent = &fixture.agent;

    let mut events = agent.subscribe().unwrap();

    agent.allocate(container("short-lived")).unwrap();
    agent.initialize("short-lived").await.unwrap();
    agent.run("short-lived").unwrap();

    // Wait for completion, then age the entry past the reap interval.
    loop {
        if let ContainerEvent::Complete { .. } = events.recv().await.unwrap() {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(matches!(
        agent.lookup("short-lived").unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(fixture.runtime.sandbox("short-lived").is_none());
    assert_eq!(
        agent.remaining_resources(),
        Resources::new(1024, 1024, 10)
    );
}

#[tokio::test(start_paused = true)]
async fn reaper_never_touches_live_containers() {
    let mut config = test_config();
    config.container_reap_interval = Duration::from_millis(50);
    let fixture = start_agent(config).await;
    let agent = &fixture.agent;

    agent.allocate(container("still-created")).unwrap();
    agent.initialize("still-created").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        agent.lookup("still-created").unwrap().state,
        ContainerState::Created
    );
}
