//! End-to-end pipeline behavior against an OCI layout

mod common;

use common::{Fixture, request};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use wacpack::config::schema::RetryConfig;
use wacpack::pipeline::Progress;
use wacpack::registry::{Anonymous, Registry};
use wacpack::resources::{
    Composition, ConfigStore, OtherResource, Resource, ResourceLookup, ResourceMeta,
};
use wacpack::state::Phase;
use wacpack::status::{
    COMPOSED, ComponentStatus, ConditionStatus, DEPENDENCIES_RESOLVED, PACKAGED, READY,
};
use wacpack::trace::ComponentSpan;
use wacpack::types::{DEFAULT_GROUP, ResourceRef};
use wacpack::PipelineError;

const PLUG_REQUEST: &str = r#"
name = "app"
target = "apps/app:v1"
plug = {}

[[composition.dependencies]]
component = "socket"
oci = { image = "components/socket:v1" }

[[composition.dependencies]]
component = "plug"
oci = { image = "components/plug:v1" }
"#;

fn retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        backoff_ms: 1,
    }
}

#[tokio::test]
async fn test_plug_request_publishes_to_target() {
    let fixture = Fixture::new().await;
    fixture.push_socket_and_plug().await;
    let pipeline = fixture.pipeline();
    let request = request(PLUG_REQUEST);
    let cancel = CancellationToken::new();

    let published = pipeline
        .run_to_completion(&request, &retry(), &cancel)
        .await
        .unwrap();
    assert_eq!(published.repository, "apps/app");
    assert!(published.digest.is_some());

    let pulled = fixture.registry.pull(&published, &Anonymous).await.unwrap();
    assert!(wasmparser::Parser::is_component(&pulled.bytes));

    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    assert!(status.is_ready());
    assert_eq!(status.observed_generation, 1);
    assert_eq!(status.image.as_ref(), Some(&published));
    assert_eq!(status.dependencies.len(), 2);
    assert_eq!(status.dependencies[0].component, "socket");
    assert!(
        status.dependencies[0]
            .wit
            .imports
            .contains(&"example:greet/greeter".to_string())
    );
    assert!(
        status
            .dependencies
            .iter()
            .all(|d| d.image.as_ref().is_some_and(|i| i.digest.is_some()))
    );
}

#[tokio::test]
async fn test_steps_advance_one_phase_at_a_time() {
    let fixture = Fixture::new().await;
    fixture.push_socket_and_plug().await;
    let pipeline = fixture.pipeline();
    let request = request(PLUG_REQUEST);
    let cancel = CancellationToken::new();

    assert_eq!(
        pipeline.step(&request, &cancel).await.unwrap(),
        Progress::Pending(Phase::Resolving)
    );
    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    let resolved = status.condition(DEPENDENCIES_RESOLVED).unwrap();
    assert_eq!(resolved.status, ConditionStatus::Unknown);
    assert_eq!(resolved.message, "resolved 1 of 2");

    assert_eq!(
        pipeline.step(&request, &cancel).await.unwrap(),
        Progress::Pending(Phase::Composing)
    );
    assert_eq!(
        pipeline.step(&request, &cancel).await.unwrap(),
        Progress::Pending(Phase::Packaging)
    );
    assert!(pipeline.composed(&request.key()).await.unwrap().is_some());

    let first = match pipeline.step(&request, &cancel).await.unwrap() {
        Progress::Complete(reference) => reference,
        other => panic!("expected completion, got {other:?}"),
    };
    // completed requests report the same reference without redoing work
    assert_eq!(
        pipeline.step(&request, &cancel).await.unwrap(),
        Progress::Complete(first)
    );
}

#[tokio::test]
async fn test_stopping_before_packaging_never_pushes() {
    let fixture = Fixture::new().await;
    fixture.push_socket_and_plug().await;
    let pipeline = fixture.pipeline();
    let request = request(PLUG_REQUEST);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        assert_eq!(
            pipeline
                .run_until(&request, Phase::Packaging, &retry(), &cancel)
                .await
                .unwrap(),
            Progress::Pending(Phase::Packaging)
        );
    }
    assert_eq!(
        pipeline.phase(&request).await.unwrap(),
        Some(Phase::Packaging)
    );
    assert!(pipeline.composed(&request.key()).await.unwrap().is_some());
    let tags = fixture.registry.tags().await.unwrap();
    assert!(!tags.iter().any(|t| t.starts_with("apps/app")), "{tags:?}");

    // a later full run still publishes
    let published = pipeline
        .run_to_completion(&request, &retry(), &cancel)
        .await
        .unwrap();
    assert_eq!(published.repository, "apps/app");
}

#[tokio::test]
async fn test_compose_is_deterministic_across_requests() {
    let fixture = Fixture::new().await;
    fixture.push_socket_and_plug().await;
    let pipeline = fixture.pipeline();
    let cancel = CancellationToken::new();

    let first = request(PLUG_REQUEST);
    let second = request(&PLUG_REQUEST.replace("name = \"app\"", "name = \"copy\""));
    let a = pipeline
        .run_to_completion(&first, &retry(), &cancel)
        .await
        .unwrap();
    let b = pipeline
        .run_to_completion(&second, &retry(), &cancel)
        .await
        .unwrap();

    assert_eq!(a.digest, b.digest);
    assert_eq!(
        pipeline.composed(&first.key()).await.unwrap(),
        pipeline.composed(&second.key()).await.unwrap()
    );
}

#[tokio::test]
async fn test_generation_change_restarts_pipeline() {
    let fixture = Fixture::new().await;
    fixture.push_socket_and_plug().await;
    let pipeline = fixture.pipeline();
    let cancel = CancellationToken::new();

    let v1 = request(PLUG_REQUEST);
    pipeline
        .run_to_completion(&v1, &retry(), &cancel)
        .await
        .unwrap();

    let v2 = request(&format!("generation = 2\n{}", PLUG_REQUEST));
    assert_eq!(
        pipeline.step(&v2, &cancel).await.unwrap(),
        Progress::Pending(Phase::Resolving)
    );

    let status = pipeline.status(&v2.key()).await.unwrap().unwrap();
    assert_eq!(status.observed_generation, 2);
    assert_eq!(status.dependencies.len(), 1);
    assert!(status.image.is_none());
    assert_eq!(
        status.condition(COMPOSED).unwrap().status,
        ConditionStatus::Unknown
    );
    assert!(!status.is_ready());
}

#[tokio::test]
async fn test_component_references_use_recorded_image() {
    let fixture = Fixture::new().await;
    let (socket, plug) = fixture.push_socket_and_plug().await;
    fixture.add_component("socket", &socket).await;
    fixture.add_component("greeter", &plug).await;

    let pipeline = fixture.pipeline();
    let request = request(
        r#"
name = "greeting"
target = "apps/greeting:v1"
plug = {}

[[composition.dependencies]]
component = "socket"
ref = { kind = "Component", name = "socket" }

[[composition.dependencies]]
component = "greeter"
ref = { kind = "Component", name = "greeter" }
"#,
    );
    pipeline
        .run_to_completion(&request, &retry(), &CancellationToken::new())
        .await
        .unwrap();

    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    assert_eq!(status.dependencies[1].image.as_ref(), Some(&plug));
    assert_eq!(status.trace.len(), 2);
    assert_eq!(status.trace[1].name, "greeter");
    assert_eq!(status.trace[1].digest, plug.digest);

    let greeter = ResourceRef::new("Component", "default", "greeter");
    assert_eq!(
        fixture.resources.trackers(&greeter).await,
        vec![request.reference()]
    );
}

#[tokio::test]
async fn test_cycle_is_detected_before_readiness() {
    let fixture = Fixture::new().await;
    fixture.push_socket_and_plug().await;
    let request = request(
        r#"
name = "app"
plug = {}

[[composition.dependencies]]
component = "a"
oci = { image = "components/socket:v1" }

[[composition.dependencies]]
component = "b"
ref = { kind = "Composition", name = "b" }
"#,
    );

    // b was built from something that already contains this request, and
    // has not yet observed its latest generation
    let owner = ComponentSpan::synthesize(&request.identity(), None, Vec::new());
    let mut b_status = ComponentStatus {
        observed_generation: 1,
        trace: vec![owner],
        ..Default::default()
    };
    b_status.mark_true(READY);
    let mut b_meta = ResourceMeta::new("default", "b");
    b_meta.generation = 2;
    fixture
        .resources
        .put(Resource::Composition(Composition {
            metadata: b_meta,
            spec: Default::default(),
            status: b_status,
        }))
        .await
        .unwrap();

    let pipeline = fixture.pipeline();
    let cancel = CancellationToken::new();
    assert_eq!(
        pipeline.step(&request, &cancel).await.unwrap(),
        Progress::Pending(Phase::Resolving)
    );

    let err = pipeline.step(&request, &cancel).await.unwrap_err();
    assert_eq!(err.reason(), "CycleDetected");
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("(2 of 2)"));

    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    let condition = status.condition(DEPENDENCIES_RESOLVED).unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, "CycleDetected");
    assert_eq!(
        status.condition(READY).unwrap().status,
        ConditionStatus::False
    );

    // the first dependency stays resolved
    assert_eq!(status.dependencies.len(), 1);
    assert_eq!(status.dependencies[0].component, "a");

    // the recorded trace has the colliding span cut off
    assert_eq!(status.trace.len(), 1);
    assert_eq!(status.trace[0].name, "b");
    assert!(status.trace[0].trace[0].cycle_omitted);
    assert_eq!(status.trace[0].trace[0].uid, request.uid);
}

#[tokio::test]
async fn test_missing_reference_is_durable() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline();
    let request = request(
        r#"
name = "app"
plug = {}

[[composition.dependencies]]
component = "gone"
ref = { kind = "Component", name = "gone" }
"#,
    );

    let err = pipeline
        .run_to_completion(&request, &retry(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "ComponentNotFound");
    assert!(err.to_string().contains("(1 of 1)"));

    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    let condition = status.condition(DEPENDENCIES_RESOLVED).unwrap();
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, "ComponentNotFound");
}

#[tokio::test]
async fn test_reference_to_other_kind_is_not_a_component() {
    let fixture = Fixture::new().await;
    fixture
        .resources
        .put(Resource::Other(OtherResource {
            group: "gateway.example.dev".to_string(),
            kind: "Route".to_string(),
            metadata: ResourceMeta::new("default", "edge"),
        }))
        .await
        .unwrap();

    let pipeline = fixture.pipeline();
    let request = request(
        r#"
name = "app"
plug = {}

[[composition.dependencies]]
component = "edge"
ref = { group = "gateway.example.dev", kind = "Route", name = "edge" }
"#,
    );
    let err = pipeline
        .step(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotComponent(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_unobserved_generation_blocks_silently() {
    let fixture = Fixture::new().await;
    let (_, plug) = fixture.push_socket_and_plug().await;
    let mut component = fixture.add_component("greeter", &plug).await;
    component.metadata.generation = 2;
    fixture
        .resources
        .put(Resource::Component(component))
        .await
        .unwrap();

    let pipeline = fixture.pipeline();
    let request = request(
        r#"
name = "app"
plug = {}

[[composition.dependencies]]
component = "greeter"
ref = { kind = "Component", name = "greeter" }
"#,
    );
    let err = pipeline
        .step(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "Blocked");
    assert!(err.is_retryable());

    // nothing is recorded while blocked
    assert!(pipeline.status(&request.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_readiness_of_references() {
    let fixture = Fixture::new().await;
    let (_, plug) = fixture.push_socket_and_plug().await;
    let mut pending = fixture.add_component("pending", &plug).await;
    pending
        .status
        .mark_unknown(READY, "Reconciling", "still building");
    let mut failed = fixture.add_component("failed", &plug).await;
    failed.status.mark_false(READY, "BuildFailed", "bad input");
    let mut imageless = fixture.add_component("imageless", &plug).await;
    imageless.status.image = None;
    for component in [pending, failed, imageless] {
        fixture
            .resources
            .put(Resource::Component(component))
            .await
            .unwrap();
    }

    let pipeline = fixture.pipeline();
    let cancel = CancellationToken::new();
    let single = |name: &str| {
        request(&format!(
            "name = \"uses-{name}\"\nplug = {{}}\n\n[[composition.dependencies]]\ncomponent = \"dep\"\nref = {{ kind = \"Component\", name = \"{name}\" }}\n"
        ))
    };

    let request = single("pending");
    let err = pipeline.step(&request, &cancel).await.unwrap_err();
    assert_eq!(err.reason(), "NotReady");
    assert!(err.is_retryable());
    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    assert_eq!(
        status.condition(DEPENDENCIES_RESOLVED).unwrap().status,
        ConditionStatus::Unknown
    );

    let request = single("failed");
    let err = pipeline.step(&request, &cancel).await.unwrap_err();
    assert_eq!(err.reason(), "NotReady");
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("bad input"));
    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    assert_eq!(
        status.condition(DEPENDENCIES_RESOLVED).unwrap().status,
        ConditionStatus::False
    );

    let request = single("imageless");
    let err = pipeline.step(&request, &cancel).await.unwrap_err();
    assert_eq!(err.reason(), "ImageMissing");
}

#[tokio::test]
async fn test_plug_and_wac_together_is_invalid() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline();
    let request = request(
        r#"
name = "app"
plug = {}
wac = "package test:app;"

[[composition.dependencies]]
component = "never-fetched"
oci = { image = "components/missing:v1" }
"#,
    );

    let err = pipeline
        .step(&request, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "Invalid");
    assert_eq!(err.to_string(), "only one of .spec[plug, wac] may be set");

    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    assert!(status.dependencies.is_empty());
    assert_eq!(
        status.condition(DEPENDENCIES_RESOLVED).unwrap().status,
        ConditionStatus::False
    );
}

#[tokio::test]
async fn test_config_dependency_with_script() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline();
    let request = request(
        r#"
name = "settings"
target = "apps/settings:v1"
wac = """
package test:settings;
let settings = new wacpack:settings {};
export settings["wasi:config/store@0.2.0-draft"];
"""

[[composition.dependencies]]
component = "settings"
config = { values = { greeting = "hello", target = "world" } }
"#,
    );

    let published = pipeline
        .run_to_completion(&request, &retry(), &CancellationToken::new())
        .await
        .unwrap();
    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    assert!(status.is_ready());
    assert_eq!(
        status.condition(PACKAGED).unwrap().status,
        ConditionStatus::True
    );
    assert!(status.dependencies[0].image.is_none());
    assert!(
        status
            .wit
            .unwrap()
            .exports
            .contains(&"wasi:config/store@0.2.0-draft".to_string())
    );

    let config = fixture
        .registry
        .pull_config(&published, &Anonymous)
        .await
        .unwrap();
    assert_eq!(config.author, "wacpack");
}

#[tokio::test]
async fn test_config_components_are_deterministic() {
    let fixture = Fixture::new().await;
    let cancel = CancellationToken::new();

    let mut first = BTreeMap::new();
    first.insert("B".to_string(), "2".to_string());
    first.insert("A".to_string(), "1".to_string());
    let mut second = BTreeMap::new();
    second.insert("A".to_string(), "1".to_string());
    second.insert("B".to_string(), "2".to_string());

    let a = fixture.tools.synthesize_config(&first, &cancel).await.unwrap();
    let b = fixture.tools.synthesize_config(&second, &cancel).await.unwrap();
    assert_eq!(a, b);

    let packager = wacpack::artifact::Packager::new(fixture.tools.clone(), "test");
    let a = packager.pack(a, &cancel).await.unwrap();
    let b = packager.pack(b, &cancel).await.unwrap();
    assert_eq!(a.digest(), b.digest());
}

#[tokio::test]
async fn test_cancelled_run_stops_without_retrying() {
    let fixture = Fixture::new().await;
    fixture.push_socket_and_plug().await;
    let pipeline = fixture.pipeline();
    let request = request(PLUG_REQUEST);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline
        .run_to_completion(&request, &retry(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));

    // a later run with a live token finishes the work
    pipeline
        .run_to_completion(&request, &retry(), &CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reset_forgets_progress() {
    let fixture = Fixture::new().await;
    fixture.push_socket_and_plug().await;
    let pipeline = fixture.pipeline();
    let request = request(PLUG_REQUEST);
    let cancel = CancellationToken::new();

    pipeline.step(&request, &cancel).await.unwrap();
    assert!(pipeline.status(&request.key()).await.unwrap().is_some());

    pipeline.reset(&request.key()).await.unwrap();
    assert!(pipeline.status(&request.key()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_published_reference_is_a_group_resource() {
    let request = request(PLUG_REQUEST);
    assert_eq!(request.reference().group, DEFAULT_GROUP);
    assert_eq!(request.reference().kind, "Composition");
}

#[tokio::test]
async fn test_config_store_reference_uses_published_component() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline();
    let cancel = CancellationToken::new();

    let mut store = ConfigStore {
        metadata: ResourceMeta::new("default", "settings"),
        values: BTreeMap::from([("greeting".to_string(), "hello".to_string())]),
        status: ComponentStatus::default(),
    };
    store.status = pipeline
        .publish_config_store(&store, &cancel)
        .await
        .unwrap();
    assert!(store.status.is_ready());
    assert_eq!(store.status.observed_generation, 1);
    let image = store.status.image.clone().unwrap();
    assert_eq!(image.repository, "default/settings");
    assert!(image.digest.is_some());
    assert!(
        store
            .status
            .wit
            .as_ref()
            .unwrap()
            .exports
            .contains(&"wasi:config/store@0.2.0-draft".to_string())
    );
    fixture
        .resources
        .put(Resource::ConfigStore(store))
        .await
        .unwrap();

    let request = request(
        r#"
name = "app"
target = "apps/app:v1"
wac = """
package test:app;
let settings = new wacpack:settings {};
export settings["wasi:config/store@0.2.0-draft"];
"""

[[composition.dependencies]]
component = "settings"
ref = { kind = "ConfigStore", name = "settings" }
"#,
    );
    pipeline
        .run_to_completion(&request, &retry(), &cancel)
        .await
        .unwrap();

    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    assert!(status.is_ready());
    assert_eq!(status.dependencies[0].image.as_ref(), Some(&image));
    assert_eq!(status.trace[0].kind, "ConfigStore");
}

#[tokio::test]
async fn test_changed_reference_restarts_dependents() {
    let fixture = Fixture::new().await;
    let (socket, plug) = fixture.push_socket_and_plug().await;
    fixture.add_component("socket", &socket).await;
    fixture.add_component("greeter", &plug).await;

    let pipeline = fixture.pipeline();
    let request = request(
        r#"
name = "greeting"
target = "apps/greeting:v1"
plug = {}

[[composition.dependencies]]
component = "socket"
ref = { name = "socket" }

[[composition.dependencies]]
component = "greeter"
ref = { name = "greeter" }
"#,
    );
    let cancel = CancellationToken::new();
    let published = pipeline
        .run_to_completion(&request, &retry(), &cancel)
        .await
        .unwrap();

    let greeter = ResourceRef::new("Component", "default", "greeter");
    assert_eq!(
        pipeline.invalidate_dependents(&greeter).await.unwrap(),
        vec![request.reference()]
    );
    assert_eq!(
        pipeline.phase(&request).await.unwrap(),
        Some(Phase::Resolving)
    );
    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    let resolved = status.condition(DEPENDENCIES_RESOLVED).unwrap();
    assert_eq!(resolved.status, ConditionStatus::Unknown);
    assert_eq!(resolved.reason, "DependencyChanged");
    assert_eq!(status.readiness().reason, "DependencyChanged");
    assert!(status.dependencies.is_empty());
    assert_eq!(status.image.as_ref(), Some(&published));

    // untracked references restart nothing
    let unrelated = ResourceRef::new("Component", "default", "unrelated");
    assert!(pipeline.invalidate_dependents(&unrelated).await.unwrap().is_empty());

    let republished = pipeline
        .run_to_completion(&request, &retry(), &cancel)
        .await
        .unwrap();
    assert_eq!(republished, published);
    let status = pipeline.status(&request.key()).await.unwrap().unwrap();
    assert!(status.is_ready());
    assert_eq!(status.dependencies.len(), 2);
}
