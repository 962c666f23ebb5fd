use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bundlebee_engine::{command::Source, config::ApplyOptions};
use serde_json::json;

mod common;

use common::*;

fn options(alveolus: &str) -> ApplyOptions {
    ApplyOptions {
        alveolus: alveolus.to_owned(),
        ..ApplyOptions::default()
    }
}

fn position(events: &[String], event: &str) -> usize {
    events
        .iter()
        .position(|it| it == event)
        .unwrap_or_else(|| panic!("{event} not found in {events:?}"))
}

#[tokio::test(start_paused = true)]
async fn dependency_is_applied_before_awaited_descriptor() {
    let engine = engine(
        json!({
            "alveoli": [
                {
                    "name": "a",
                    "descriptors": [{
                        "name": "svc",
                        "await": true,
                        "awaitConditions": [{
                            "conditions": [{
                                "type": "JSON_POINTER",
                                "pointer": "/status/phase",
                                "value": "Running"
                            }]
                        }]
                    }],
                    "dependencies": [{"name": "b"}]
                },
                {"name": "b", "descriptors": [{"name": "cm"}]}
            ]
        }),
        &[("svc", config_map("svc")), ("cm", config_map("cm"))],
    );
    let cluster = Arc::new(FakeCluster {
        statuses: BTreeMap::from([("svc".to_owned(), json!({"phase": "Running"}))]),
        ..FakeCluster::default()
    });

    engine
        .apply(&Source::default(), &options("a"), cluster.clone())
        .await
        .unwrap();

    assert_eq!(cluster.applied(), vec!["cm", "svc"]);
    let events = cluster.events();
    assert!(position(&events, "applied:svc") < position(&events, "get:svc"));
}

#[tokio::test(start_paused = true)]
async fn barrier_groups_run_in_sequence() {
    let engine = engine(
        json!({
            "alveoli": [{
                "name": "app",
                "descriptors": [
                    {"name": "first"},
                    {
                        "name": "second",
                        "await": true,
                        "awaitConditions": [{
                            "conditions": [{
                                "type": "STATUS_CONDITION",
                                "conditionType": "Ready",
                                "value": "True"
                            }]
                        }]
                    },
                    {"name": "third"}
                ]
            }]
        }),
        &[
            ("first", config_map("first")),
            ("second", config_map("second")),
            ("third", config_map("third")),
        ],
    );
    let cluster = Arc::new(FakeCluster {
        apply_delays: BTreeMap::from([("first".to_owned(), Duration::from_secs(1))]),
        statuses: BTreeMap::from([(
            "second".to_owned(),
            json!({"conditions": [{"type": "Ready", "status": "True"}]}),
        )]),
        ..FakeCluster::default()
    });

    engine
        .apply(&Source::default(), &options("app"), cluster.clone())
        .await
        .unwrap();

    let events = cluster.events();
    // first and second share a group, third waits for both
    assert!(position(&events, "apply:second") < position(&events, "applied:first"));
    assert!(position(&events, "applied:first") < position(&events, "apply:third"));
    assert!(position(&events, "get:second") < position(&events, "apply:third"));
}

#[tokio::test(start_paused = true)]
async fn diamond_dependency_is_applied_once() {
    let engine = engine(
        json!({
            "alveoli": [
                {
                    "name": "app",
                    "descriptors": [{"name": "app"}],
                    "dependencies": [{"name": "left"}, {"name": "right"}]
                },
                {
                    "name": "left",
                    "descriptors": [{"name": "left"}],
                    "dependencies": [{"name": "shared"}]
                },
                {
                    "name": "right",
                    "descriptors": [{"name": "right"}],
                    "dependencies": [{"name": "shared"}]
                },
                {"name": "shared", "descriptors": [{"name": "shared", "await": true}]}
            ]
        }),
        &[
            ("app", config_map("app")),
            ("left", config_map("left")),
            ("right", config_map("right")),
            ("shared", config_map("shared")),
        ],
    );
    let cluster = Arc::new(FakeCluster {
        apply_delays: BTreeMap::from([("shared".to_owned(), Duration::from_secs(1))]),
        ..FakeCluster::default()
    });

    engine
        .apply(&Source::default(), &options("app"), cluster.clone())
        .await
        .unwrap();

    let applied = cluster.applied();
    assert_eq!(applied.iter().filter(|it| *it == "shared").count(), 1);
    assert_eq!(applied.first().map(String::as_str), Some("shared"));
    assert_eq!(applied.last().map(String::as_str), Some("app"));
    assert_eq!(applied.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn chained_dependencies_run_one_after_the_other() {
    let manifest = |chain: bool| {
        json!({
            "alveoli": [
                {
                    "name": "app",
                    "chainDependencies": chain,
                    "dependencies": [{"name": "slow"}, {"name": "fast"}]
                },
                {"name": "slow", "descriptors": [{"name": "slow"}]},
                {"name": "fast", "descriptors": [{"name": "fast"}]}
            ]
        })
    };
    let descriptors = [("slow", config_map("slow")), ("fast", config_map("fast"))];
    let cluster = || {
        Arc::new(FakeCluster {
            apply_delays: BTreeMap::from([("slow".to_owned(), Duration::from_secs(5))]),
            ..FakeCluster::default()
        })
    };

    let chained = cluster();
    engine(manifest(true), &descriptors)
        .apply(&Source::default(), &options("app"), chained.clone())
        .await
        .unwrap();
    assert_eq!(chained.applied(), vec!["slow", "fast"]);

    let parallel = cluster();
    engine(manifest(false), &descriptors)
        .apply(&Source::default(), &options("app"), parallel.clone())
        .await
        .unwrap();
    assert_eq!(parallel.applied(), vec!["fast", "slow"]);
}

#[tokio::test(start_paused = true)]
async fn timeout_names_descriptor_and_lets_siblings_complete() {
    let engine = engine(
        json!({
            "alveoli": [{
                "name": "app",
                "descriptors": [
                    {
                        "name": "fast",
                        "awaitConditions": [{
                            "conditions": [{
                                "type": "JSON_POINTER",
                                "pointer": "/metadata/name",
                                "value": "fast"
                            }]
                        }]
                    },
                    {
                        "name": "stuck",
                        "await": true,
                        "awaitConditions": [{
                            "conditions": [{
                                "type": "JSON_POINTER",
                                "pointer": "/status/phase",
                                "value": "Running"
                            }]
                        }]
                    },
                    {"name": "never"}
                ]
            }]
        }),
        &[
            ("fast", config_map("fast")),
            ("stuck", config_map("stuck")),
            ("never", config_map("never")),
        ],
    );
    let cluster = Arc::new(FakeCluster::default());

    let error = engine
        .apply(&Source::default(), &options("app"), cluster.clone())
        .await
        .unwrap_err();

    let rendered = error_chain(&error);
    assert!(
        rendered.contains("timeout awaiting stuck, condition: JSON_POINTER /status/phase EQUALS Running"),
        "{rendered}"
    );
    assert_eq!(cluster.applied(), vec!["fast", "stuck"]);
    assert!(cluster.events().contains(&"get:fast".to_owned()));
}

#[tokio::test]
async fn every_failure_is_reported() {
    let engine = engine(
        json!({
            "alveoli": [
                {"name": "app", "dependencies": [{"name": "left"}, {"name": "right"}]},
                {"name": "left", "descriptors": [{"name": "missing-left"}]},
                {"name": "right", "descriptors": [{"name": "missing-right"}]}
            ]
        }),
        &[],
    );
    let cluster = Arc::new(FakeCluster::default());

    let error = engine
        .apply(&Source::default(), &options("app"), cluster.clone())
        .await
        .unwrap_err();

    let rendered = error_chain(&error);
    assert!(rendered.contains("2 failures"), "{rendered}");
    assert!(rendered.contains("\"missing-left\""), "{rendered}");
    assert!(rendered.contains("\"missing-right\""), "{rendered}");
    assert!(cluster.applied().is_empty());
}

#[tokio::test]
async fn labels_are_injected() {
    let engine = engine(
        json!({
            "alveoli": [{
                "name": "com.company:app:1.2.3",
                "descriptors": [{"name": "cm"}]
            }]
        }),
        &[("cm", config_map("cm"))],
    );
    let cluster = Arc::new(FakeCluster::default());

    engine
        .apply(&Source::default(), &ApplyOptions::default(), cluster.clone())
        .await
        .unwrap();

    let labels = cluster
        .object("cm")
        .and_then(|object| object.pointer("/metadata/labels").cloned())
        .unwrap();
    assert_eq!(labels["bundlebee.root.alveolus.name"], "com.company-app-1.2.3");
    assert_eq!(labels["bundlebee.root.alveolus.version"], "1.2.3");
    assert!(labels["bundlebee.timestamp"].is_string());
}

#[tokio::test]
async fn remote_dependency_is_downloaded() {
    let archives = InMemoryArchives::default().with(bundle(
        "com.company:lib:1.0.0",
        json!({"alveoli": [{"name": "lib", "descriptors": [{"name": "lib-cm"}]}]}),
        &[("lib-cm", config_map("lib-cm"))],
    ));
    let engine = engine_with_archives(
        json!({
            "alveoli": [{
                "name": "app",
                "descriptors": [{"name": "app"}],
                "dependencies": [{"name": "lib", "location": "com.company:lib:1.0.0"}]
            }]
        }),
        &[("app", config_map("app"))],
        Arc::new(archives),
    );
    let cluster = Arc::new(FakeCluster::default());

    engine
        .apply(&Source::default(), &options("app"), cluster.clone())
        .await
        .unwrap();

    assert_eq!(cluster.applied(), vec!["lib-cm", "app"]);
}

#[tokio::test]
async fn unsatisfied_requirement_stops_the_command() {
    let engine = engine(
        json!({
            "requirements": [{"minBundlebeeVersion": "999.0.0"}],
            "alveoli": [{"name": "app", "descriptors": [{"name": "cm"}]}]
        }),
        &[("cm", config_map("cm"))],
    );
    let cluster = Arc::new(FakeCluster::default());

    let error = engine
        .apply(&Source::default(), &options("app"), cluster.clone())
        .await
        .unwrap_err();

    assert!(error_chain(&error).contains("expected at least \"999.0.0\""));
    assert!(cluster.events().is_empty());
}

#[tokio::test]
async fn dry_run_requires_dry_run_cluster() {
    let engine = engine(json!({"alveoli": [{"name": "app"}]}), &[]);

    let error = engine
        .apply(
            &Source::default(),
            &ApplyOptions {
                dry_run: true,
                ..options("app")
            },
            Arc::new(FakeCluster::default()),
        )
        .await
        .unwrap_err();

    assert_eq!(
        error.to_string(),
        "dry-run requested but the cluster client is not in dry-run mode"
    );
}
