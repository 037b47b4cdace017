//! The responder protocol engine.
//!
//! One engine task owns the transport, the registry handle, and every
//! in-flight registration. Its poll loop drains commands, drains received
//! packets, drives the per-service probe/announce machines, and flushes the
//! outgoing queue. Service registrations move strictly forward:
//!
//! Probing -> Announcing -> Established,
//!
//! except for the probing -> probing edge a detected conflict takes after
//! renaming. Probing covers two record sets at once, the service records
//! under the instance name and the address records under the hostname;
//! every probe carries both questions and a conflict against either set
//! cancels the whole attempt.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::sync::{mpsc, oneshot};
use futures::{Async, Future, Poll, Stream};
use log::{debug, info, warn};
use rand::{thread_rng, Rng};
use tokio_core::reactor::{Handle, Timeout};

use crate::error::{Error, Result};
use crate::name::Name;
use crate::proto::{
    validate_query_flags, validate_response_flags, RecordType, ANNOUNCE_COUNT, ANNOUNCE_INTERVAL,
    CLASS_IN, CLASS_MASK, MAX_NAME_ATTEMPTS, PROBE_COUNT, PROBE_INTERVAL, TTL_HOST,
};
use crate::response::ResponseState;
use crate::services::{host_records, next_instance_name, Phase, ServiceData, Services};
use crate::transport::Transport;
use crate::wire::{self, Message, Question, ResourceRecord};

/// Instructions from the public facade to the engine.
pub enum Command {
    Register {
        data: ServiceData,
        done: oneshot::Sender<Result<String>>,
    },
    Unregister {
        instance: String,
        done: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// One name and the records probing defends under it.
struct ProbeSet {
    name: Name,
    records: Vec<ResourceRecord>,
}

enum RegPhase {
    Probing {
        sets: Vec<ProbeSet>,
        sent: u32,
        timer: Timeout,
    },
    Announcing {
        remaining: u32,
        timer: Timeout,
    },
}

/// What one pass over a registration's timers produced.
enum Step {
    Wait,
    Probe(Message),
    Won,
    Announce { finished: bool },
}

struct Registration {
    instance: String,
    phase: RegPhase,
    done: Option<oneshot::Sender<Result<String>>>,
}

/// The engine future. Runs until told to shut down or until every command
/// sender is gone.
pub struct Fsm<T: Transport> {
    transport: T,
    services: Services,
    response: ResponseState,
    commands: mpsc::UnboundedReceiver<Command>,
    registrations: Vec<Registration>,
    outgoing: VecDeque<(Vec<u8>, SocketAddr)>,
    handle: Handle,
    /// Hostname renames consumed so far; bounded like instance renames.
    host_attempts: u32,
}

impl<T: Transport> Fsm<T> {
    pub fn new(
        handle: &Handle,
        transport: T,
        services: &Services,
    ) -> (Fsm<T>, mpsc::UnboundedSender<Command>) {
        let (tx, rx) = mpsc::unbounded();
        let fsm = Fsm {
            transport,
            services: services.clone(),
            response: ResponseState::new(),
            commands: rx,
            registrations: Vec::new(),
            outgoing: VecDeque::new(),
            handle: handle.clone(),
            host_attempts: 1,
        };
        (fsm, tx)
    }

    fn handle_command(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::Register { data, done } => {
                self.start_registration(data, done)?;
                Ok(false)
            }
            Command::Unregister { instance, done } => {
                let result = self.unregister(&instance);
                let _ = done.send(result);
                Ok(false)
            }
            Command::Shutdown => Ok(true),
        }
    }

    fn start_registration(
        &mut self,
        data: ServiceData,
        done: oneshot::Sender<Result<String>>,
    ) -> Result<()> {
        let instance = data.instance.clone();
        {
            let mut services = self.services.write().unwrap();
            if let Err(err) = services.register(data) {
                let _ = done.send(Err(err));
                return Ok(());
            }
        }

        let phase = self.fresh_probe_phase(&instance)?;
        info!("probing for {}", instance);
        self.registrations.push(Registration {
            instance,
            phase,
            done: Some(done),
        });
        Ok(())
    }

    /// A probing phase for the service's current name, with the RFC 6762
    /// §8.1 random initial delay.
    fn fresh_probe_phase(&self, instance: &str) -> Result<RegPhase> {
        let (fqdn, service_records, hostname, addresses) = {
            let services = self.services.read().unwrap();
            let entry = services.get(instance).ok_or_else(|| {
                Error::validation("instance", instance, "unknown instance name")
            })?;
            let hostname = services.hostname().clone();
            (
                entry.data.fqdn.clone(),
                entry.data.service_records(&hostname),
                hostname,
                services.addresses().to_vec(),
            )
        };

        let sets = vec![
            ProbeSet {
                name: fqdn,
                records: service_records,
            },
            ProbeSet {
                name: hostname.clone(),
                records: host_records(&hostname, &addresses, TTL_HOST),
            },
        ];
        let jitter = Duration::from_millis(thread_rng().gen_range(0, 250));
        let timer = Timeout::new(jitter, &self.handle).map_err(|e| Error::network("timer", e))?;
        Ok(RegPhase::Probing {
            sets,
            sent: 0,
            timer,
        })
    }

    fn unregister(&mut self, instance: &str) -> Result<()> {
        // A registration still probing or announcing is simply abandoned.
        let mut cancelled = false;
        let mut i = 0;
        while i < self.registrations.len() {
            if self.registrations[i].instance.eq_ignore_ascii_case(instance) {
                let mut reg = self.registrations.remove(i);
                if let Some(tx) = reg.done.take() {
                    let _ = tx.send(Err(Error::Cancelled));
                }
                cancelled = true;
            } else {
                i += 1;
            }
        }

        let (removed, hostname, was_established) = {
            let mut services = self.services.write().unwrap();
            let was_established = services
                .get(instance)
                .map(|entry| entry.phase == Phase::Established)
                .unwrap_or(false);
            let hostname = services.hostname().clone();
            (services.remove(instance), hostname, was_established)
        };

        match removed {
            Some(data) => {
                if was_established {
                    // Goodbye: the record set at TTL zero, once.
                    let mut message = Message::response(0);
                    message.answers = data.goodbye_set(&hostname);
                    self.queue_multicast(message);
                    info!("said goodbye for {}", data.instance);
                }
                Ok(())
            }
            None if cancelled => Ok(()),
            None => Err(Error::validation(
                "instance",
                instance,
                "unknown instance name",
            )),
        }
    }

    fn queue_multicast(&mut self, message: Message) {
        let dest = self.transport.multicast_dest();
        self.outgoing.push_back((message.to_bytes(), dest));
    }

    fn recv_packets(&mut self) -> Result<()> {
        loop {
            match self.transport.recv_from()? {
                Some((data, src)) => self.handle_packet(&data, src),
                None => return Ok(()),
            }
        }
    }

    fn handle_packet(&mut self, data: &[u8], src: SocketAddr) {
        let message = match wire::parse(data) {
            Ok(message) => message,
            Err(err) => {
                // Malformed input is dropped, never surfaced.
                debug!("ignoring packet from {}: {}", src, err);
                return;
            }
        };

        if message.is_response() {
            if !validate_response_flags(message.header.flags) {
                return;
            }
            self.check_conflicts(&message);
        } else {
            if !validate_query_flags(message.header.flags) {
                return;
            }
            if !message.authorities.is_empty() {
                self.tiebreak_probes(&message);
            }
            self.answer_query(&message, src);
        }
    }

    fn answer_query(&mut self, query: &Message, src: SocketAddr) {
        let reply = {
            let services = self.services.read().unwrap();
            self.response.build(query, &services, Instant::now())
        };
        if let Some(reply) = reply {
            let dest = if reply.unicast {
                src
            } else {
                self.transport.multicast_dest()
            };
            self.outgoing.push_back((reply.message.to_bytes(), dest));
        }
    }

    /// An authoritative answer for a name we are still probing, carrying
    /// records we do not hold, means the name is taken: rename and start
    /// over.
    fn check_conflicts(&mut self, message: &Message) {
        let mut conflicts: Vec<(usize, bool)> = Vec::new();
        for (i, reg) in self.registrations.iter().enumerate() {
            let sets = match &reg.phase {
                RegPhase::Probing { sets, .. } => sets,
                RegPhase::Announcing { .. } => continue,
            };
            'sets: for (set_idx, set) in sets.iter().enumerate() {
                for incoming in message.answers.iter().chain(message.additionals.iter()) {
                    if incoming.class & CLASS_MASK != CLASS_IN {
                        continue;
                    }
                    if incoming.name != set.name {
                        continue;
                    }
                    let same_type = set
                        .records
                        .iter()
                        .any(|ours| ours.rtype == incoming.rtype);
                    let matches_ours =
                        set.records.iter().any(|ours| ours.key() == incoming.key());
                    if same_type && !matches_ours {
                        conflicts.push((i, set_idx == 1));
                        break 'sets;
                    }
                }
            }
        }
        // Highest index first: a terminal failure removes its registration.
        for (i, host) in conflicts.into_iter().rev() {
            self.resolve_conflict(i, host);
        }
    }

    /// RFC 6762 §8.2.1: a probe from a peer for a name we are probing is
    /// settled by comparing record sets; the lexicographically later one
    /// wins and the loser renames.
    fn tiebreak_probes(&mut self, message: &Message) {
        let mut conflicts: Vec<(usize, bool)> = Vec::new();
        for (i, reg) in self.registrations.iter().enumerate() {
            let sets = match &reg.phase {
                RegPhase::Probing { sets, .. } => sets,
                RegPhase::Announcing { .. } => continue,
            };
            for (set_idx, set) in sets.iter().enumerate() {
                let theirs: Vec<&ResourceRecord> = message
                    .authorities
                    .iter()
                    .filter(|rec| rec.class & CLASS_MASK == CLASS_IN && rec.name == set.name)
                    .collect();
                if theirs.is_empty() {
                    continue;
                }
                let ours: Vec<&ResourceRecord> = set.records.iter().collect();
                if record_sets_cmp(&ours, &theirs) == Ordering::Less {
                    conflicts.push((i, set_idx == 1));
                    break;
                }
            }
        }
        for (i, host) in conflicts.into_iter().rev() {
            self.resolve_conflict(i, host);
        }
    }

    fn resolve_conflict(&mut self, i: usize, host_conflict: bool) {
        let outcome = if host_conflict {
            self.rename_host()
        } else {
            self.rename_instance(i)
        };
        if let Err(err) = outcome {
            // Attempts exhausted: the registration fails terminally. The
            // error goes to the caller alone; it is theirs to report.
            let reg = self.registrations.remove(i);
            {
                let mut services = self.services.write().unwrap();
                services.remove(&reg.instance);
            }
            if let Some(tx) = reg.done {
                let _ = tx.send(Err(err));
            }
        }
    }

    fn rename_instance(&mut self, i: usize) -> Result<()> {
        let old_instance = self.registrations[i].instance.clone();
        let new_instance = {
            let mut services = self.services.write().unwrap();
            let (attempts, data) = match services.get(&old_instance) {
                Some(entry) => (entry.attempts, entry.data.clone()),
                None => {
                    return Err(Error::validation(
                        "instance",
                        &old_instance,
                        "unknown instance name",
                    ));
                }
            };
            if attempts >= MAX_NAME_ATTEMPTS {
                return Err(Error::validation(
                    "instance",
                    &old_instance,
                    format!("no unique name after {} attempts", MAX_NAME_ATTEMPTS),
                ));
            }

            let mut candidate = next_instance_name(&old_instance);
            let mut spare = MAX_NAME_ATTEMPTS;
            loop {
                let renamed = data.renamed(candidate.clone())?;
                match services.rename(&old_instance, renamed) {
                    Ok(()) => break candidate,
                    Err(_) if spare > 0 => {
                        // Taken locally as well; keep counting up.
                        spare -= 1;
                        candidate = next_instance_name(&candidate);
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        info!(
            "conflict on {:?}: renamed to {:?}, probing again",
            old_instance, new_instance
        );
        let phase = self.fresh_probe_phase(&new_instance)?;
        let reg = &mut self.registrations[i];
        reg.instance = new_instance;
        reg.phase = phase;
        Ok(())
    }

    /// Host-record conflicts rename the hostname itself and restart every
    /// probing registration, since their SRV targets all change.
    fn rename_host(&mut self) -> Result<()> {
        if self.host_attempts >= MAX_NAME_ATTEMPTS {
            return Err(Error::validation(
                "hostname",
                "host records",
                format!("no unique hostname after {} attempts", MAX_NAME_ATTEMPTS),
            ));
        }
        self.host_attempts += 1;

        let new_hostname = {
            let mut services = self.services.write().unwrap();
            let next = next_hostname(services.hostname());
            services.set_hostname(next.clone());
            next
        };
        info!("host record conflict: hostname is now {}", new_hostname);

        let instances: Vec<String> = self
            .registrations
            .iter()
            .filter(|reg| matches!(reg.phase, RegPhase::Probing { .. }))
            .map(|reg| reg.instance.clone())
            .collect();
        for instance in instances {
            let phase = self.fresh_probe_phase(&instance)?;
            if let Some(reg) = self
                .registrations
                .iter_mut()
                .find(|reg| reg.instance == instance)
            {
                reg.phase = phase;
            }
        }
        Ok(())
    }

    fn drive_registrations(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.registrations.len() {
            if self.drive_one(i)? {
                // Established (or gone); the registration record is done.
                self.registrations.remove(i);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Advances one registration as far as its timers allow. Returns true
    /// once the registration should be dropped from the in-flight list.
    fn drive_one(&mut self, i: usize) -> Result<bool> {
        loop {
            let step = {
                let reg = &mut self.registrations[i];
                match &mut reg.phase {
                    RegPhase::Probing { sets, sent, timer } => {
                        match timer.poll().map_err(|e| Error::network("timer", e))? {
                            Async::NotReady => Step::Wait,
                            Async::Ready(()) => {
                                if *sent < PROBE_COUNT {
                                    *sent += 1;
                                    timer.reset(Instant::now() + PROBE_INTERVAL);
                                    Step::Probe(probe_message(sets))
                                } else {
                                    // One quiet interval after the last
                                    // probe: the name is won.
                                    Step::Won
                                }
                            }
                        }
                    }
                    RegPhase::Announcing { remaining, timer } => {
                        match timer.poll().map_err(|e| Error::network("timer", e))? {
                            Async::NotReady => Step::Wait,
                            Async::Ready(()) => {
                                *remaining -= 1;
                                timer.reset(Instant::now() + ANNOUNCE_INTERVAL);
                                Step::Announce {
                                    finished: *remaining == 0,
                                }
                            }
                        }
                    }
                }
            };

            match step {
                Step::Wait => return Ok(false),
                Step::Probe(message) => self.queue_multicast(message),
                Step::Won => self.begin_announcing(i)?,
                Step::Announce { finished } => {
                    if !self.announce(i) {
                        // Unregistered mid-announce; nothing left to do.
                        return Ok(true);
                    }
                    if finished {
                        self.finish(i);
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn begin_announcing(&mut self, i: usize) -> Result<()> {
        let instance = self.registrations[i].instance.clone();
        {
            let mut services = self.services.write().unwrap();
            services.set_phase(&instance, Phase::Announcing);
        }
        debug!("probing won for {}; announcing", instance);
        let timer = Timeout::new(Duration::from_millis(0), &self.handle)
            .map_err(|e| Error::network("timer", e))?;
        self.registrations[i].phase = RegPhase::Announcing {
            remaining: ANNOUNCE_COUNT,
            timer,
        };
        Ok(())
    }

    /// Multicasts the full record set. False if the registry entry has
    /// vanished underneath us.
    fn announce(&mut self, i: usize) -> bool {
        let instance = self.registrations[i].instance.clone();
        let records = {
            let services = self.services.read().unwrap();
            match services.get(&instance) {
                Some(entry) => entry
                    .data
                    .record_set(services.hostname(), services.addresses()),
                None => return false,
            }
        };
        let mut message = Message::response(0);
        message.answers = records;
        self.response
            .note_multicast(&message.answers, Instant::now());
        self.queue_multicast(message);
        true
    }

    /// Final transition: mark Established and release the caller.
    fn finish(&mut self, i: usize) {
        let reg = &mut self.registrations[i];
        {
            let mut services = self.services.write().unwrap();
            services.set_phase(&reg.instance, Phase::Established);
        }
        info!("{} established", reg.instance);
        if let Some(tx) = reg.done.take() {
            let _ = tx.send(Ok(reg.instance.clone()));
        }
    }

    fn send_pending(&mut self) -> Result<()> {
        while let Some((data, dest)) = self.outgoing.pop_front() {
            match self.transport.send_to(&data, &dest) {
                Ok(true) => continue,
                Ok(false) => {
                    self.outgoing.push_front((data, dest));
                    return Ok(());
                }
                Err(err) => {
                    // Send failures are per-packet; the socket stays up.
                    warn!("send to {} failed: {}", dest, err);
                }
            }
        }
        Ok(())
    }
}

impl<T: Transport> Future for Fsm<T> {
    type Item = ();
    type Error = Error;

    fn poll(&mut self) -> Poll<(), Error> {
        loop {
            match self.commands.poll() {
                Ok(Async::Ready(Some(command))) => {
                    if self.handle_command(command)? {
                        return Ok(Async::Ready(()));
                    }
                }
                Ok(Async::Ready(None)) => {
                    debug!("all command handles dropped; engine stopping");
                    return Ok(Async::Ready(()));
                }
                Ok(Async::NotReady) | Err(()) => break,
            }
        }

        self.recv_packets()?;
        self.drive_registrations()?;
        self.send_pending()?;
        Ok(Async::NotReady)
    }
}

/// The probe query: one ANY question per defended name, our proposed
/// records in the authority section for peer tie-breaking.
fn probe_message(sets: &[ProbeSet]) -> Message {
    let mut message = Message::default();
    for set in sets {
        message.questions.push(Question {
            name: set.name.clone(),
            qtype: RecordType::Any.to_u16(),
            qclass: CLASS_IN,
        });
        message.authorities.extend(set.records.iter().cloned());
    }
    message
}

/// Compares two record sets for the probe tie-break: records pairwise in
/// sorted order; a full prefix match hands the win to the longer set.
fn record_sets_cmp(ours: &[&ResourceRecord], theirs: &[&ResourceRecord]) -> Ordering {
    let mut ours: Vec<&ResourceRecord> = ours.to_vec();
    let mut theirs: Vec<&ResourceRecord> = theirs.to_vec();
    ours.sort_by(|a, b| a.tiebreak_cmp(b));
    theirs.sort_by(|a, b| a.tiebreak_cmp(b));

    for (a, b) in ours.iter().zip(theirs.iter()) {
        match a.tiebreak_cmp(b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    ours.len().cmp(&theirs.len())
}

/// `host` -> `host-2` -> `host-3`, on the first label.
fn next_hostname(current: &Name) -> Name {
    let first = current.first_label().unwrap_or_default();
    let bumped = match first.rfind('-') {
        Some(dash)
            if !first[dash + 1..].is_empty()
                && first[dash + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            let n: u64 = first[dash + 1..].parse().unwrap_or(1);
            format!("{}-{}", &first[..dash], n + 1)
        }
        _ => format!("{}-2", first),
    };
    let rest: Vec<String> = current
        .labels()
        .iter()
        .skip(1)
        .map(|l| String::from_utf8_lossy(l).into_owned())
        .collect();
    let text = if rest.is_empty() {
        bumped
    } else {
        format!("{}.{}", bumped, rest.join("."))
    };
    Name::from_str(&text).unwrap_or_else(|_| current.clone())
}
