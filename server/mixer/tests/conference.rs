//! Conference lifecycle over real channels and the 20 ms mixer tick.

use std::sync::Arc;
use std::time::Duration;

use xb_core::tech_null::NullTech;
use xb_core::{Application, ChannelTech, Core, CoreOptions};
use xb_frame::{slin, AudioFormat, Frame, FrameKind, SAMPLES_PER_FRAME};
use xb_mixer::{ConfCommand, ConferenceApp, Conferences};

async fn setup() -> (Arc<Core>, Arc<NullTech>, Arc<ConferenceApp>) {
    let core = Core::start(CoreOptions::default());
    let tech = NullTech::new();
    core.techs
        .add("Null", Arc::clone(&tech) as Arc<dyn ChannelTech>);
    let app = Arc::new(ConferenceApp::new(Conferences::new(&core)));
    (core, tech, app)
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn voice(samples: &[i16]) -> Frame {
    Frame::voice(AudioFormat::Slin, slin::encode(samples), samples.len(), "test")
}

#[tokio::test]
async fn members_hear_each_other_and_room_auto_destroys() {
    let (core, tech, app) = setup().await;
    let mut events = core.events.subscribe();

    let a = tech.new_channel(&core, "alice").unwrap();
    let b = tech.new_channel(&core, "bob").unwrap();
    let b_name = b.name();

    let (app_a, chan_a) = (Arc::clone(&app), Arc::clone(&a));
    let task_a = tokio::spawn(async move { app_a.exec(&chan_a, &args(&["room", "S"])).await });
    let (app_b, chan_b) = (Arc::clone(&app), Arc::clone(&b));
    let task_b = tokio::spawn(async move { app_b.exec(&chan_b, &args(&["room", "S"])).await });

    // Give both members time to seat, then talk from A.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.conferences().count(), 1);
    let talk: Vec<i16> = vec![4000; SAMPLES_PER_FRAME * 5];
    a.queue_frame(voice(&talk));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let heard: Vec<Frame> = tech
        .written_to(&b_name)
        .into_iter()
        .filter(|f| f.is_voice())
        .collect();
    assert!(!heard.is_empty(), "B heard A's audio through the mixer");
    let carried = heard.iter().any(|f| match &f.kind {
        FrameKind::Voice { data, samples, .. } => {
            *samples == SAMPLES_PER_FRAME && slin::decode(data).iter().any(|&s| s == 4000)
        }
        _ => false,
    });
    assert!(carried, "some mixed frame carries A's samples");

    // A leaves via DTMF '#', B by remote hangup.
    a.queue_frame(Frame::dtmf('#', "test"));
    b.queue_hangup();
    task_a.await.unwrap();
    task_b.await.unwrap();

    // The empty room auto-destroys on the next tick.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.conferences().count(), 0);

    let mut saw_create = false;
    let mut joins = 0;
    let mut saw_remove = false;
    while let Ok(ev) = events.try_recv() {
        match ev.name {
            "NConference-ConfCreate" => saw_create = true,
            "NConference-Join" => joins += 1,
            "NConference-ConfRemove" => saw_remove = true,
            _ => {}
        }
    }
    assert!(saw_create);
    assert_eq!(joins, 2);
    assert!(saw_remove);

    a.hangup().await.unwrap();
    b.hangup().await.unwrap();
}

#[tokio::test]
async fn locked_conference_turns_away_non_masters() {
    let (core, tech, app) = setup().await;

    let master = tech.new_channel(&core, "master").unwrap();
    let (app_m, chan_m) = (Arc::clone(&app), Arc::clone(&master));
    let task_m = tokio::spawn(async move { app_m.exec(&chan_m, &args(&["board", "M"])).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let conf = app.conferences().get("board").expect("created");
    conf.set_locked(true);

    // A speaker bounces off the locked door immediately.
    let guest = tech.new_channel(&core, "guest").unwrap();
    let res = app.exec(&guest, &args(&["board", "S"])).await;
    assert_eq!(res, xb_core::AppReturn::Ok);
    assert_eq!(conf.member_count(), 1, "guest was not seated");

    master.queue_frame(Frame::dtmf('#', "test"));
    task_m.await.unwrap();
    guest.hangup().await.unwrap();
    master.hangup().await.unwrap();
}

#[tokio::test]
async fn wrong_pin_is_refused() {
    let (core, tech, app) = setup().await;

    let master = tech.new_channel(&core, "owner").unwrap();
    let (app_m, chan_m) = (Arc::clone(&app), Arc::clone(&master));
    let task_m =
        tokio::spawn(async move { app_m.exec(&chan_m, &args(&["pinned", "M", "1234"])).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let conf = app.conferences().get("pinned").expect("created");
    assert_eq!(conf.pin().as_deref(), Some("1234"));

    let guest = tech.new_channel(&core, "guest").unwrap();
    app.exec(&guest, &args(&["pinned", "S", "9999"])).await;
    assert_eq!(conf.member_count(), 1, "wrong PIN refused");

    let invited = tech.new_channel(&core, "invited").unwrap();
    let (app_i, chan_i) = (Arc::clone(&app), Arc::clone(&invited));
    let task_i =
        tokio::spawn(async move { app_i.exec(&chan_i, &args(&["pinned", "S", "1234"])).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(conf.member_count(), 2, "correct PIN admitted");

    master.queue_hangup();
    invited.queue_hangup();
    task_m.await.unwrap();
    task_i.await.unwrap();
    guest.hangup().await.unwrap();
    master.hangup().await.unwrap();
    invited.hangup().await.unwrap();
}

#[tokio::test]
async fn mute_all_command_silences_other_members() {
    let (core, tech, app) = setup().await;

    let m1 = tech.new_channel(&core, "m1").unwrap();
    let m2 = tech.new_channel(&core, "m2").unwrap();
    let (a1, c1) = (Arc::clone(&app), Arc::clone(&m1));
    let t1 = tokio::spawn(async move { a1.exec(&c1, &args(&["ops", "M"])).await });
    let (a2, c2) = (Arc::clone(&app), Arc::clone(&m2));
    let t2 = tokio::spawn(async move { a2.exec(&c2, &args(&["ops", "S"])).await });
    tokio::time::sleep(Duration::from_millis(80)).await;

    let conf = app.conferences().get("ops").expect("created");
    conf.command(ConfCommand::MuteAll {
        mute: true,
        issuer: Some(m1.name()),
    });
    tokio::time::sleep(Duration::from_millis(80)).await;

    let members = conf.members_snapshot();
    for m in &members {
        if m.chan().name() == m1.name() {
            assert!(!m.talk_mute(), "issuer is exempt");
        } else {
            assert!(m.talk_mute(), "other members muted");
        }
    }

    m1.queue_hangup();
    m2.queue_hangup();
    t1.await.unwrap();
    t2.await.unwrap();
    m1.hangup().await.unwrap();
    m2.hangup().await.unwrap();
}
