mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fakes::FakeHost;
use songfall_engine::plugin::{ScriptHost, ScriptPluginLoader};
use songfall_engine::{ResolveError, ScriptError};
use songfall_proto::config::ExclusionPolicy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn script_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plugin.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("window.getKuwoUrl = () => {}"))
        .mount(&server)
        .await;
    server
}

fn loader(host: Arc<FakeHost>, policy: ExclusionPolicy) -> ScriptPluginLoader {
    ScriptPluginLoader::new(
        reqwest::Client::new(),
        host,
        policy,
        Duration::from_secs(2),
    )
}

#[tokio::test]
async fn resolves_and_detaches_script() {
    let server = script_server().await;
    let host = Arc::new(FakeHost::resolving("getKuwoUrl", "http://cdn/42.mp3"));
    let loader = loader(host.clone(), ExclusionPolicy::Queue);

    let url = loader
        .load(&format!("{}/plugin.js", server.uri()), "getKuwoUrl", "42")
        .await
        .unwrap();

    assert_eq!(url, "http://cdn/42.mp3");
    assert_eq!(host.attached(), 0);
    assert_eq!(host.removed().len(), 1);
}

#[tokio::test]
async fn missing_capability_still_detaches() {
    let server = script_server().await;
    let host = Arc::new(FakeHost::resolving("getKuwoUrl", "unused").without_capability());
    let loader = loader(host.clone(), ExclusionPolicy::Queue);

    let err = loader
        .load(&format!("{}/plugin.js", server.uri()), "getKuwoUrl", "42")
        .await
        .unwrap_err();

    assert_eq!(err, ResolveError::PluginMethodMissing("getKuwoUrl".to_string()));
    assert_eq!(host.attached(), 0);
    assert_eq!(host.removed().len(), 1);
}

#[tokio::test]
async fn capability_errors_and_empty_results_fail_resolution() {
    let server = script_server().await;
    let url = format!("{}/plugin.js", server.uri());

    for result in [
        Err(ScriptError::Invocation("TypeError: boom".to_string())),
        Ok(None),
        Ok(Some("  ".to_string())),
    ] {
        let host = Arc::new(FakeHost::resolving("getQqUrl", "unused").with_result(result));
        let loader = loader(host.clone(), ExclusionPolicy::Queue);

        let err = loader.load(&url, "getQqUrl", "1").await.unwrap_err();
        assert!(matches!(err, ResolveError::PluginResolution(_)), "{:?}", err);
        assert_eq!(host.attached(), 0);
    }
}

#[tokio::test]
async fn failed_injection_leaves_nothing_attached() {
    let server = script_server().await;
    let host = Arc::new(FakeHost::resolving("getKuwoUrl", "unused").failing_inject());
    let loader = loader(host.clone(), ExclusionPolicy::Queue);

    let err = loader
        .load(&format!("{}/plugin.js", server.uri()), "getKuwoUrl", "42")
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::PluginLoad(_)));
    assert_eq!(host.attached(), 0);
    assert!(host.removed().is_empty());
}

#[tokio::test]
async fn unreachable_script_is_a_load_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let host = Arc::new(FakeHost::resolving("getKuwoUrl", "unused"));
    let loader = loader(host.clone(), ExclusionPolicy::Queue);

    let err = loader
        .load(&format!("{}/missing.js", server.uri()), "getKuwoUrl", "42")
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::PluginLoad(_)));
    assert_eq!(host.max_attached(), 0);
}

#[tokio::test]
async fn slow_capability_times_out_and_detaches() {
    let server = script_server().await;
    let host = Arc::new(
        FakeHost::resolving("getKuwoUrl", "http://cdn/late.mp3")
            .with_invoke_delay(Duration::from_secs(30)),
    );
    let loader = ScriptPluginLoader::new(
        reqwest::Client::new(),
        host.clone(),
        ExclusionPolicy::Queue,
        Duration::from_millis(100),
    );

    let err = loader
        .load(&format!("{}/plugin.js", server.uri()), "getKuwoUrl", "42")
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::PluginResolution(_)));
    assert_eq!(host.attached(), 0);
}

#[tokio::test]
async fn queued_loads_never_overlap() {
    let server = script_server().await;
    let host = Arc::new(
        FakeHost::resolving("getKuwoUrl", "http://cdn/x.mp3")
            .with_invoke_delay(Duration::from_millis(50)),
    );
    let loader = Arc::new(loader(host.clone(), ExclusionPolicy::Queue));
    let url = format!("{}/plugin.js", server.uri());

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let loader = loader.clone();
            let url = url.clone();
            tokio::spawn(async move { loader.load(&url, "getKuwoUrl", &i.to_string()).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "http://cdn/x.mp3");
    }

    assert_eq!(host.max_attached(), 1);
    assert_eq!(host.removed().len(), 4);
    assert_eq!(host.attached(), 0);
}

#[tokio::test]
async fn fail_fast_refuses_concurrent_load() {
    let server = script_server().await;
    let host = Arc::new(
        FakeHost::resolving("getKuwoUrl", "http://cdn/x.mp3")
            .with_invoke_delay(Duration::from_millis(300)),
    );
    let loader = Arc::new(loader(host.clone(), ExclusionPolicy::FailFast));
    let url = format!("{}/plugin.js", server.uri());

    let first = tokio::spawn({
        let loader = loader.clone();
        let url = url.clone();
        async move { loader.load(&url, "getKuwoUrl", "1").await }
    });
    host.injected.notified().await;

    let err = loader.load(&url, "getKuwoUrl", "2").await.unwrap_err();
    assert!(matches!(err, ResolveError::PluginLoad(_)));

    assert_eq!(first.await.unwrap().unwrap(), "http://cdn/x.mp3");
    assert_eq!(host.max_attached(), 1);
    assert_eq!(host.attached(), 0);
}
