//! Registry, lifecycle and request tests

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use rvoip_channel_core::channel::{ChannelState, HangupCause, SoftHangup};
use rvoip_channel_core::cli::{show_channels, show_channeltypes};
use rvoip_channel_core::devicestate::DeviceState;
use rvoip_channel_core::error::ChannelError;
use rvoip_channel_core::events::ChannelEvent;
use rvoip_channel_core::format::Format;
use rvoip_channel_core::frame::ControlType;
use rvoip_channel_core::group::{app_group_get_count, app_group_match_get_count, app_group_set_channel};
use rvoip_channel_core::tech::ChannelTech;

#[tokio::test]
async fn test_alloc_starts_down_and_is_listed_once() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();

    let a = mock_leg(&registry, &tech, "Mock/a-0001").await;
    let _b = mock_leg(&registry, &tech, "Mock/b-0001").await;
    assert_eq!(a.chan.state().await, ChannelState::Down);

    let mut seen = Vec::new();
    let mut prev = None;
    while let Some(chan) = registry.walk_channels(prev.as_ref()).await {
        seen.push(chan.name());
        prev = Some(chan.unlock());
    }
    assert_eq!(seen.len(), 2);
    assert_eq!(seen.iter().filter(|n| n.as_str() == "Mock/a-0001").count(), 1);
    // Newest first
    assert_eq!(seen[0], "Mock/b-0001");
}

#[tokio::test]
async fn test_duplicate_technology_rejected() {
    let registry = test_registry();
    registry.register_technology(MockTech::new("Mock", Format::ULAW)).unwrap();
    let err = registry
        .register_technology(MockTech::new("mock", Format::ALAW))
        .unwrap_err();
    assert!(matches!(err, ChannelError::DuplicateTechnology { .. }));
    assert_eq!(registry.channel_types().len(), 1);
    assert!(registry.lookup_technology("MOCK").is_some());
}

#[tokio::test]
async fn test_find_by_name_and_exten() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();
    let leg = mock_leg(&registry, &tech, "Mock/alice-0001").await;
    {
        let mut c = leg.chan.lock().await;
        c.set_context("sales");
        c.set_exten("200");
    }

    let found = registry.find_by_name("mock/ALICE-0001").await.unwrap();
    assert!(Arc::ptr_eq(found.channel(), &leg.chan));
    drop(found);

    assert!(registry.find_by_name_prefix("Mock/alice").await.is_some());
    assert!(registry.find_by_name_prefix("Mock/bob").await.is_none());
    assert!(registry.find_by_exten("200", "sales").await.is_some());
    assert!(registry.find_by_exten("200", "support").await.is_none());
}

#[tokio::test]
async fn test_lookup_gives_up_on_locked_channel() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();
    let leg = mock_leg(&registry, &tech, "Mock/held-0001").await;

    let held = leg.chan.lock().await;
    assert!(registry.find_by_name("Mock/held-0001").await.is_none());
    drop(held);
    assert!(registry.find_by_name("Mock/held-0001").await.is_some());
}

#[tokio::test]
async fn test_hangup_unlinks_and_publishes() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();
    let leg = mock_leg(&registry, &tech, "Mock/a-0001").await;
    let mut events = registry.subscribe();

    leg.chan.hangup_with_cause(HangupCause::UserBusy).await.unwrap();

    assert_eq!(registry.active_channels(), 0);
    assert!(registry.find_by_name("Mock/a-0001").await.is_none());
    assert_eq!(tech.hangups.load(Ordering::Relaxed), 1);

    let events = drain_events(&mut events);
    let hangup = events
        .iter()
        .find_map(|ev| match ev {
            ChannelEvent::Hangup { channel, cause, .. } => Some((channel.clone(), *cause)),
            _ => None,
        })
        .unwrap();
    assert_eq!(hangup, ("Mock/a-0001".to_string(), HangupCause::UserBusy.code()));
    assert!(events
        .iter()
        .any(|ev| matches!(ev, ChannelEvent::DeviceStateChange { device } if device == "Mock/a")));
}

#[tokio::test]
async fn test_unregister_technology_hangs_up_its_channels() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();
    let leg = mock_leg(&registry, &tech, "Mock/a-0001").await;

    let as_dyn: Arc<dyn ChannelTech> = tech.clone();
    registry.unregister_technology(&as_dyn).await;

    assert!(registry.lookup_technology("Mock").is_none());
    let c = leg.chan.lock().await;
    assert!(c.softhangup_flags().contains(SoftHangup::APPUNLOAD));
}

#[tokio::test]
async fn test_shutdown_refuses_new_channels() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();
    let leg = mock_leg(&registry, &tech, "Mock/a-0001").await;

    registry.begin_shutdown(true).await;
    assert!(leg.chan.check_hangup().await);
    assert!(leg
        .chan
        .lock()
        .await
        .softhangup_flags()
        .contains(SoftHangup::SHUTDOWN));
    let err = registry.channel_alloc(tech.clone(), "Mock/b-0001").await.unwrap_err();
    assert!(matches!(err, ChannelError::ShuttingDown));

    registry.cancel_shutdown();
    assert!(registry.channel_alloc(tech.clone(), "Mock/b-0001").await.is_ok());
}

#[tokio::test]
async fn test_request_unknown_technology() {
    let registry = test_registry();
    let err = registry.request("Nope", Format::ULAW, "1000").await.unwrap_err();
    assert!(matches!(err, ChannelError::TechnologyNotFound { .. }));
}

#[tokio::test]
async fn test_request_needs_translation_path() {
    let registry = test_registry();
    registry.register_technology(MockTech::new("Mock", Format::ULAW)).unwrap();
    assert!(registry.request("Mock", Format::GSM, "1000").await.is_err());

    let registry = test_registry_with(g711_translators());
    registry.register_technology(MockTech::new("Mock", Format::ULAW)).unwrap();
    let chan = registry.request("Mock", Format::ALAW, "1000").await.unwrap();
    assert!(chan.name().starts_with("Mock/1000-"));
}

#[tokio::test]
async fn test_request_and_dial_answered() {
    let registry = test_registry();
    registry.register_technology(MockTech::new("Mock", Format::ULAW)).unwrap();

    let outcome = registry
        .request_and_dial("Mock", Format::ULAW, "1000", Some(Duration::from_secs(2)), Some("100"), Some("Alice"))
        .await
        .unwrap();
    assert_eq!(outcome.state, Some(ControlType::Answer));
    let chan = outcome.channel.unwrap();
    assert_eq!(chan.state().await, ChannelState::Up);
    assert_eq!(chan.lock().await.cid.num.as_deref(), Some("100"));
}

#[tokio::test]
async fn test_request_and_dial_busy() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();

    let outcome = registry
        .request_and_dial("Mock", Format::ULAW, "busy", Some(Duration::from_secs(2)), None, None)
        .await
        .unwrap();
    assert!(outcome.channel.is_none());
    assert_eq!(outcome.state, Some(ControlType::Busy));
    assert_eq!(registry.active_channels(), 0);
    assert_eq!(tech.hangups.load(Ordering::Relaxed), 1);

    let outcome = registry
        .request_and_dial("Mock", Format::ULAW, "unavailable", Some(Duration::from_secs(2)), None, None)
        .await
        .unwrap();
    assert!(outcome.channel.is_none());
    assert_eq!(outcome.state, Some(ControlType::Busy));
}

#[tokio::test]
async fn test_request_and_dial_no_answer_times_out() {
    let registry = test_registry();
    registry.register_technology(MockTech::new("Mock", Format::ULAW)).unwrap();

    let outcome = registry
        .request_and_dial("Mock", Format::ULAW, "noanswer", Some(Duration::from_millis(100)), None, None)
        .await
        .unwrap();
    assert!(outcome.channel.is_none());
    assert_eq!(outcome.state, Some(ControlType::Ringing));
    assert_eq!(registry.active_channels(), 0);
}

#[tokio::test]
async fn test_answer_moves_to_up() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();
    let leg = mock_leg(&registry, &tech, "Mock/a-0001").await;
    let mut events = registry.subscribe();

    leg.chan.setstate(ChannelState::Ring).await;
    leg.chan.answer().await.unwrap();
    assert_eq!(leg.chan.state().await, ChannelState::Up);

    let names: Vec<&str> = drain_events(&mut events).iter().map(|e| e.name()).collect();
    assert!(names.contains(&"Newchannel"));
    assert!(names.contains(&"Newstate"));
}

#[tokio::test]
async fn test_device_state() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();

    assert_eq!(registry.device_state("Mock/busy").await, DeviceState::Busy);
    assert_eq!(registry.device_state("Mock/1000").await, DeviceState::NotInUse);
    assert_eq!(registry.device_state("Nope/1000").await, DeviceState::Invalid);
    assert_eq!(registry.device_state("garbage").await, DeviceState::Invalid);

    let leg = mock_leg(&registry, &tech, "Mock/1000-0001").await;
    assert_eq!(registry.device_state("Mock/1000").await, DeviceState::InUse);
    leg.chan.setstate(ChannelState::Ringing).await;
    assert_eq!(registry.device_state("Mock/1000").await, DeviceState::Ringing);
}

#[tokio::test]
async fn test_group_counts() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();
    let a = mock_leg(&registry, &tech, "Mock/a-0001").await;
    let b = mock_leg(&registry, &tech, "Mock/b-0001").await;
    let c = mock_leg(&registry, &tech, "Mock/c-0001").await;

    app_group_set_channel(&a.chan, "sales").await.unwrap();
    app_group_set_channel(&b.chan, "SALES").await.unwrap();
    app_group_set_channel(&c.chan, "support@outbound").await.unwrap();

    assert_eq!(app_group_get_count(&registry, "sales", None).await, 2);
    assert_eq!(app_group_get_count(&registry, "support", None).await, 0);
    assert_eq!(app_group_get_count(&registry, "support", Some("outbound")).await, 1);
    assert_eq!(app_group_match_get_count(&registry, "^(sal|SAL)", None).await, 2);
    assert_eq!(app_group_match_get_count(&registry, "(", None).await, 0);
}

#[tokio::test]
async fn test_cli_tables() {
    let registry = test_registry();
    let tech = MockTech::new("Mock", Format::ULAW);
    registry.register_technology(tech.clone()).unwrap();
    let _a = mock_leg(&registry, &tech, "Mock/a-0001").await;
    let _b = mock_leg(&registry, &tech, "Mock/b-0001").await;

    let types = show_channeltypes(&registry);
    assert!(types.contains("Mock"));
    assert!(types.contains("Mock channel driver"));
    assert!(types.contains("1 channel drivers loaded."));

    let chans = show_channels(&registry).await;
    assert!(chans.contains("Mock/a-0001"));
    assert!(chans.contains("s@default:1"));
    assert!(chans.contains("2 active channels"));
}
