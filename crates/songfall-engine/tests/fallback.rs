mod common;

use std::sync::Arc;

use common::fakes::{registry, Behavior, FakeResolver, RecordingSink};
use songfall_engine::{ControllerEvent, FallbackController, PlayError};
use songfall_proto::protocol::ResolutionPhase;
use tokio::sync::Notify;

fn controller(
    n: usize,
    resolver: &Arc<FakeResolver>,
    sink: &Arc<RecordingSink>,
) -> FallbackController {
    FallbackController::new(registry(n), resolver.clone(), sink.clone())
}

#[tokio::test]
async fn first_working_source_wins() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    resolver.fail("s0");
    resolver.ok("s1", "http://s1/42.mp3");
    resolver.ok("s2", "http://s2/42.mp3");
    let ctl = controller(3, &resolver, &sink);

    let audio = ctl.play("42").await.expect("s1 should resolve");

    assert_eq!(audio.url, "http://s1/42.mp3");
    assert_eq!(resolver.calls(), ["s0", "s1"]);
    assert_eq!(sink.started(), [("42".to_string(), "http://s1/42.mp3".to_string())]);
    assert_eq!(ctl.phase().await, ResolutionPhase::Succeeded);
    assert_eq!(ctl.default_source().await, 1);
    assert_eq!(ctl.session().await.unwrap().attempts(), 1);
}

#[tokio::test]
async fn exhausts_after_each_source_once() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    let ctl = controller(4, &resolver, &sink);
    let mut events = ctl.subscribe();

    let err = ctl.play("7").await.unwrap_err();

    assert_eq!(
        err,
        PlayError::Exhausted {
            song_id: "7".to_string(),
            attempts: 4
        }
    );
    assert_eq!(resolver.calls(), ["s0", "s1", "s2", "s3"]);
    assert!(sink.started().is_empty());
    assert_eq!(ctl.phase().await, ResolutionPhase::Exhausted);

    let mut failed = 0;
    let mut exhausted = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ControllerEvent::SourceFailed { .. } => failed += 1,
            ControllerEvent::Exhausted { attempts, .. } => {
                assert_eq!(attempts, 4);
                exhausted += 1;
            }
            _ => {}
        }
    }
    assert_eq!((failed, exhausted), (4, 1));
}

#[tokio::test]
async fn attempts_wrap_from_default_and_stay_bounded() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    let ctl = controller(3, &resolver, &sink).with_default_source(2);

    assert!(ctl.play("1").await.is_err());
    assert_eq!(resolver.calls(), ["s2", "s0", "s1"]);
}

#[tokio::test]
async fn single_source_is_tried_once() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    let ctl = controller(1, &resolver, &sink);

    let err = ctl.play("1").await.unwrap_err();
    assert!(matches!(err, PlayError::Exhausted { attempts: 1, .. }));
    assert_eq!(resolver.calls(), ["s0"]);
}

#[tokio::test]
async fn sink_rejection_counts_as_failed_attempt() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    resolver.ok("s0", "http://s0/broken.mp3");
    resolver.ok("s1", "http://s1/ok.mp3");
    sink.reject("http://s0/broken.mp3");
    let ctl = controller(2, &resolver, &sink);

    let audio = ctl.play("3").await.unwrap();
    assert_eq!(audio.url, "http://s1/ok.mp3");
    assert_eq!(sink.started().len(), 1);
}

#[tokio::test]
async fn stale_result_is_discarded() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    resolver.set(
        "s0",
        Behavior::Gated {
            url: "http://s0/slow.mp3".to_string(),
            entered: entered.clone(),
            release: release.clone(),
        },
    );
    resolver.ok("s1", "http://s1/fast.mp3");
    let ctl = Arc::new(controller(2, &resolver, &sink));

    let first = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.play("9").await }
    });
    entered.notified().await;

    let switched = ctl.switch_source(1).await.unwrap();
    assert_eq!(switched.unwrap().url, "http://s1/fast.mp3");

    release.notify_one();
    let stale = first.await.unwrap();
    assert_eq!(stale, Err(PlayError::Superseded("9".to_string())));

    assert_eq!(sink.started(), [("9".to_string(), "http://s1/fast.mp3".to_string())]);
    assert_eq!(ctl.phase().await, ResolutionPhase::Succeeded);
    assert_eq!(ctl.default_source().await, 1);
}

#[tokio::test]
async fn newer_play_supersedes_older_song() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    resolver.set(
        "s0",
        Behavior::Gated {
            url: "http://s0/any.mp3".to_string(),
            entered: entered.clone(),
            release: release.clone(),
        },
    );
    let ctl = Arc::new(controller(2, &resolver, &sink));

    let first = tokio::spawn({
        let ctl = ctl.clone();
        async move { ctl.play("old").await }
    });
    entered.notified().await;
    ctl.stop().await;
    release.notify_one();

    assert!(matches!(first.await.unwrap(), Err(PlayError::Superseded(_))));
    assert!(sink.started().is_empty());
    assert_eq!(ctl.phase().await, ResolutionPhase::Idle);
    assert!(ctl.session().await.is_none());
}

#[tokio::test]
async fn manual_switch_resets_attempt_budget() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    let ctl = controller(3, &resolver, &sink);

    assert!(ctl.play("5").await.is_err());
    assert_eq!(resolver.calls().len(), 3);

    let err = ctl.switch_source(1).await.unwrap_err();
    assert!(matches!(err, PlayError::Exhausted { attempts: 3, .. }));
    assert_eq!(resolver.calls()[3..], ["s1", "s2", "s0"]);

    resolver.ok("s2", "http://s2/5.mp3");
    let audio = ctl.switch_source(1).await.unwrap().unwrap();
    assert_eq!(audio.url, "http://s2/5.mp3");
    assert_eq!(ctl.session().await.unwrap().cursor(), 2);
}

#[tokio::test]
async fn switch_without_song_only_moves_default() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    let ctl = controller(3, &resolver, &sink);

    assert_eq!(ctl.switch_source(2).await, Ok(None));
    assert_eq!(ctl.default_source().await, 2);
    assert!(resolver.calls().is_empty());

    assert_eq!(ctl.next_source().await, Ok(None));
    assert_eq!(ctl.default_source().await, 0);

    assert_eq!(
        ctl.switch_source(3).await,
        Err(PlayError::InvalidSource { index: 3, len: 3 })
    );
}

#[tokio::test]
async fn playback_failure_moves_on_without_retrying_spent_sources() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    resolver.ok("s0", "http://s0/8.mp3");
    resolver.fail("s1");
    resolver.fail("s2");
    let ctl = controller(3, &resolver, &sink);

    ctl.play("8").await.unwrap();
    let err = ctl.playback_failed("8").await.unwrap_err();

    assert_eq!(
        err,
        PlayError::Exhausted {
            song_id: "8".to_string(),
            attempts: 3
        }
    );
    assert_eq!(resolver.calls(), ["s0", "s1", "s2"]);
    assert_eq!(sink.started().len(), 1);
    assert_eq!(ctl.phase().await, ResolutionPhase::Exhausted);
}

#[tokio::test]
async fn repeated_playback_failures_end_in_exhaustion() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    for name in ["s0", "s1", "s2"] {
        resolver.ok(name, &format!("http://{}/8.mp3", name));
    }
    let ctl = controller(3, &resolver, &sink).with_default_source(1);
    let mut events = ctl.subscribe();

    ctl.play("8").await.unwrap();
    let mut restarts = 0;
    let err = loop {
        match ctl.playback_failed("8").await {
            Ok(Some(_)) => restarts += 1,
            Ok(None) => panic!("failure for the active song was ignored"),
            Err(err) => break err,
        }
        assert!(restarts <= 3, "playback kept restarting");
    };

    assert_eq!(
        err,
        PlayError::Exhausted {
            song_id: "8".to_string(),
            attempts: 3
        }
    );
    assert_eq!(restarts, 2);
    assert_eq!(resolver.calls(), ["s1", "s2", "s0"]);
    assert_eq!(sink.started().len(), 3);
    assert_eq!(ctl.playback_failed("8").await, Ok(None));

    let mut failed = 0;
    let mut exhausted = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ControllerEvent::SourceFailed { .. } => failed += 1,
            ControllerEvent::Exhausted { .. } => exhausted += 1,
            _ => {}
        }
    }
    assert_eq!((failed, exhausted), (3, 1));
}

#[tokio::test]
async fn playback_failure_skips_sources_that_already_failed() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    resolver.fail("s0");
    resolver.ok("s1", "http://s1/4.mp3");
    resolver.fail("s2");
    resolver.ok("s3", "http://s3/4.mp3");
    let ctl = controller(4, &resolver, &sink);

    ctl.play("4").await.unwrap();
    let retried = ctl.playback_failed("4").await.unwrap().unwrap();
    assert_eq!(retried.url, "http://s3/4.mp3");

    let session = ctl.session().await.unwrap();
    assert_eq!(session.cursor(), 3);
    assert_eq!(session.attempts(), 3);
    assert!(session.is_charged(0) && session.is_charged(1) && session.is_charged(2));

    assert!(matches!(
        ctl.playback_failed("4").await,
        Err(PlayError::Exhausted { attempts: 4, .. })
    ));
    assert_eq!(resolver.calls(), ["s0", "s1", "s2", "s3"]);
}

#[tokio::test]
async fn manual_switch_clears_spent_sources() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    resolver.ok("s0", "http://s0/6.mp3");
    resolver.ok("s1", "http://s1/6.mp3");
    let ctl = controller(2, &resolver, &sink);

    ctl.play("6").await.unwrap();
    ctl.playback_failed("6").await.unwrap();
    assert!(ctl.playback_failed("6").await.is_err());

    let audio = ctl.switch_source(0).await.unwrap().unwrap();
    assert_eq!(audio.url, "http://s0/6.mp3");
    assert_eq!(ctl.session().await.unwrap().attempts(), 0);
}

#[tokio::test]
async fn playback_failure_for_other_song_is_ignored() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    resolver.ok("s0", "http://s0/1.mp3");
    let ctl = controller(2, &resolver, &sink);

    assert_eq!(ctl.playback_failed("1").await, Ok(None));

    ctl.play("1").await.unwrap();
    assert_eq!(ctl.playback_failed("2").await, Ok(None));
    assert_eq!(resolver.calls(), ["s0"]);

    ctl.stop().await;
    assert_eq!(ctl.playback_failed("1").await, Ok(None));
}

#[tokio::test]
async fn events_follow_attempt_order() {
    let resolver = FakeResolver::new();
    let sink = RecordingSink::new();
    resolver.fail("s0");
    resolver.ok("s1", "http://s1/2.mp3");
    let ctl = controller(2, &resolver, &sink);
    let mut events = ctl.subscribe();

    ctl.play("2").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(match event {
            ControllerEvent::Resolving { source, attempt, .. } => format!("resolving {} #{}", source, attempt),
            ControllerEvent::SourceFailed { source, .. } => format!("failed {}", source),
            ControllerEvent::Playing { source, .. } => format!("playing {}", source),
            other => format!("{:?}", other),
        });
    }
    assert_eq!(
        seen,
        ["resolving 0 #1", "failed 0", "resolving 1 #2", "playing 1"]
    );
}
