//! Probe and announce behavior, driven end to end over the in-memory
//! transport: cadence, ordering, conflict renaming.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::sync::oneshot;
use futures::Future;
use tokio_core::reactor::{Core, Timeout};

use beacon_mdns::error::Error;
use beacon_mdns::fsm::{Command, Fsm};
use beacon_mdns::name::Name;
use beacon_mdns::proto::{RecordType, FLAG_QR, MDNS_PORT};
use beacon_mdns::services::{Service, ServiceData, Services, ServicesInner};
use beacon_mdns::transport::{MemoryHandle, MemoryTransport, SentFrame};
use beacon_mdns::wire::{self, record, Message, RData};

fn test_registry() -> Services {
    Arc::new(RwLock::new(ServicesInner::new(
        Name::from_str("testhost.local").unwrap(),
        vec![Ipv4Addr::new(192, 168, 1, 10)],
    )))
}

fn peer_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 77), MDNS_PORT))
}

/// Frames the engine multicast, split into probes (queries) and
/// announcements (responses).
fn split_frames(frames: &[SentFrame]) -> (Vec<SentFrame>, Vec<SentFrame>) {
    let mut probes = Vec::new();
    let mut announces = Vec::new();
    for frame in frames {
        let msg = wire::parse(&frame.data).expect("engine sent an unparsable frame");
        if msg.header.flags & FLAG_QR == 0 {
            probes.push(frame.clone());
        } else if !msg.answers.is_empty() && msg.answers.iter().all(|r| r.ttl > 0) {
            announces.push(frame.clone());
        }
    }
    (probes, announces)
}

/// Bundles the pieces a test needs to drive one engine.
struct Rig {
    core: Core,
    services: Services,
    handle: MemoryHandle,
    commands: futures::sync::mpsc::UnboundedSender<Command>,
}

impl Rig {
    fn new() -> Rig {
        let core = Core::new().unwrap();
        let services = test_registry();
        let (transport, handle) = MemoryTransport::pair();
        let (fsm, commands) = Fsm::new(&core.handle(), transport, &services);
        core.handle()
            .spawn(fsm.map_err(|err| panic!("engine failed: {}", err)));
        Rig {
            core,
            services,
            handle,
            commands,
        }
    }

    fn register(&mut self, instance: &str) -> Result<String, Error> {
        let data =
            ServiceData::from_service(&Service::new(instance, "_http._tcp", 8080)).unwrap();
        let (done, wait) = oneshot::channel();
        self.commands
            .unbounded_send(Command::Register { data, done })
            .unwrap();
        self.core.run(wait).expect("registration oneshot dropped")
    }

    /// Runs the reactor for roughly `dur` while the engine keeps working.
    fn run_for(&mut self, dur: Duration) {
        let timer = Timeout::new(dur, &self.core.handle()).unwrap();
        self.core.run(timer).unwrap();
    }
}

#[test]
fn probing_cadence_and_announce_order() {
    let mut rig = Rig::new();
    let instance = rig.register("Cadence").expect("registration failed");
    assert_eq!(instance, "Cadence");

    let (probes, announces) = split_frames(&rig.handle.sent());
    assert_eq!(probes.len(), 3, "expected exactly three probes");
    assert_eq!(announces.len(), 2, "expected exactly two announcements");

    // Probe spacing: 250 ms nominal, 200-300 ms tolerated.
    for pair in probes.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(
            gap >= Duration::from_millis(200) && gap <= Duration::from_millis(300),
            "probe gap {:?} out of range",
            gap
        );
    }

    // Nothing is announced until after the third probe.
    let last_probe = probes.last().unwrap().at;
    let first_announce = announces.first().unwrap().at;
    assert!(first_announce > last_probe);

    // Announcements run 1 s apart.
    let announce_gap = announces[1].at.duration_since(announces[0].at);
    assert!(
        announce_gap >= Duration::from_millis(900) && announce_gap <= Duration::from_millis(1200),
        "announce gap {:?} out of range",
        announce_gap
    );
}

#[test]
fn probe_carries_both_record_sets() {
    let mut rig = Rig::new();
    rig.register("BothSets").expect("registration failed");

    let (probes, _) = split_frames(&rig.handle.sent());
    let msg = wire::parse(&probes[0].data).unwrap();

    let fqdn = Name::from_str("BothSets._http._tcp.local").unwrap();
    let host = Name::from_str("testhost.local").unwrap();
    let qnames: Vec<&Name> = msg.questions.iter().map(|q| &q.name).collect();
    assert!(qnames.contains(&&fqdn), "no service question in probe");
    assert!(qnames.contains(&&host), "no host question in probe");
    assert!(
        msg.questions
            .iter()
            .all(|q| q.qtype == RecordType::Any.to_u16()),
        "probe questions must be type ANY"
    );
    // Tie-break data rides in the authority section.
    assert!(msg.authorities.iter().any(|r| r.name == fqdn));
    assert!(msg.authorities.iter().any(|r| r.name == host));
}

#[test]
fn conflicting_answer_forces_rename() {
    let mut rig = Rig::new();

    // A peer that claims "Taken._http._tcp.local" with an SRV of its own,
    // delivered as soon as our first probe is in flight.
    let fqdn = Name::from_str("Taken._http._tcp.local").unwrap();
    let mut claim = Message::response(0);
    claim.answers.push(record(
        fqdn,
        RecordType::Srv,
        true,
        120,
        RData::Srv {
            priority: 0,
            weight: 0,
            port: 9999,
            target: Name::from_str("elsewhere.local").unwrap(),
        },
    ));
    let net = rig.handle.clone();
    let injector = Timeout::new(Duration::from_millis(300), &rig.core.handle())
        .unwrap()
        .map(move |_| net.inject(claim.to_bytes(), peer_addr()))
        .map_err(|err| panic!("injector timer failed: {}", err));
    rig.core.handle().spawn(injector);

    let instance = rig.register("Taken").expect("registration failed");
    assert_eq!(instance, "Taken (2)");

    {
        let services = rig.services.read().unwrap();
        assert!(services.get("Taken").is_none());
        assert!(services.get("Taken (2)").is_some());
    }

    // The renamed service probed again from scratch.
    let (probes, announces) = split_frames(&rig.handle.sent());
    assert!(probes.len() >= 4, "rename must restart probing");
    assert_eq!(announces.len(), 2);
    let last = wire::parse(&probes.last().unwrap().data).unwrap();
    let renamed = Name::from_str("Taken (2)._http._tcp.local").unwrap();
    assert!(last.questions.iter().any(|q| q.name == renamed));
}

#[test]
fn losing_tiebreak_forces_rename_winning_does_not() {
    // Losing: the peer's probe authority sorts lexicographically later.
    let mut rig = Rig::new();
    let fqdn = Name::from_str("Shared._http._tcp.local").unwrap();
    let mut peer_probe = Message::query(
        0,
        fqdn.clone(),
        RecordType::Any.to_u16(),
        1,
    );
    peer_probe.authorities.push(record(
        fqdn.clone(),
        RecordType::Srv,
        false,
        120,
        RData::Srv {
            priority: 0xffff,
            weight: 0xffff,
            port: 0xffff,
            target: Name::from_str("zzzzzzzz.local").unwrap(),
        },
    ));
    let net = rig.handle.clone();
    let bytes = peer_probe.to_bytes();
    let injector = Timeout::new(Duration::from_millis(300), &rig.core.handle())
        .unwrap()
        .map(move |_| net.inject(bytes, peer_addr()))
        .map_err(|err| panic!("injector timer failed: {}", err));
    rig.core.handle().spawn(injector);

    let instance = rig.register("Shared").expect("registration failed");
    assert_eq!(instance, "Shared (2)");

    // Winning: a peer probe that sorts earlier does not dislodge us.
    let mut rig = Rig::new();
    let fqdn = Name::from_str("Keeper._http._tcp.local").unwrap();
    let mut peer_probe = Message::query(0, fqdn.clone(), RecordType::Any.to_u16(), 1);
    peer_probe.authorities.push(record(
        fqdn,
        RecordType::Srv,
        false,
        120,
        RData::Srv {
            priority: 0,
            weight: 0,
            port: 1,
            target: Name::from_str("aaaa.local").unwrap(),
        },
    ));
    let net = rig.handle.clone();
    let bytes = peer_probe.to_bytes();
    let injector = Timeout::new(Duration::from_millis(300), &rig.core.handle())
        .unwrap()
        .map(move |_| net.inject(bytes, peer_addr()))
        .map_err(|err| panic!("injector timer failed: {}", err));
    rig.core.handle().spawn(injector);

    let instance = rig.register("Keeper").expect("registration failed");
    assert_eq!(instance, "Keeper");
}

#[test]
fn unregister_while_probing_cancels() {
    let mut rig = Rig::new();
    let data =
        ServiceData::from_service(&Service::new("Fleeting", "_http._tcp", 8080)).unwrap();
    let (done, wait) = oneshot::channel();
    rig.commands
        .unbounded_send(Command::Register { data, done })
        .unwrap();

    // Unregister arrives while the probes are still going out.
    let (gone, _gone_rx) = oneshot::channel();
    let commands = rig.commands.clone();
    let canceller = Timeout::new(Duration::from_millis(100), &rig.core.handle())
        .unwrap()
        .map(move |_| {
            commands
                .unbounded_send(Command::Unregister {
                    instance: "Fleeting".to_owned(),
                    done: gone,
                })
                .unwrap();
        })
        .map_err(|err| panic!("cancel timer failed: {}", err));
    rig.core.handle().spawn(canceller);

    match rig.core.run(wait).expect("oneshot dropped") {
        Err(Error::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert!(rig.services.read().unwrap().is_empty());
}

#[test]
fn established_service_says_goodbye_on_unregister() {
    let mut rig = Rig::new();
    rig.register("Mortal").expect("registration failed");
    rig.handle.clear_sent();

    let (done, wait) = oneshot::channel();
    rig.commands
        .unbounded_send(Command::Unregister {
            instance: "Mortal".to_owned(),
            done,
        })
        .unwrap();
    rig.core
        .run(wait)
        .expect("oneshot dropped")
        .expect("unregister failed");
    rig.run_for(Duration::from_millis(50));

    let sent = rig.handle.sent();
    assert_eq!(sent.len(), 1, "expected exactly one goodbye frame");
    let goodbye = wire::parse(&sent[0].data).unwrap();
    assert!(goodbye.is_response());
    assert!(!goodbye.answers.is_empty());
    assert!(goodbye.answers.iter().all(|r| r.ttl == 0));
}
