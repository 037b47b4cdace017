//! The querier protocol engine: one-shot questions with a bounded
//! collection window.
//!
//! A query multicasts a single question and then aggregates every validated
//! response that answers it until the window closes. Window expiry is the
//! success path; whatever arrived by then is the result. Responses are
//! deduplicated by record identity, and the additional records a responder
//! bundles (SRV, TXT, A alongside a PTR) are kept so the caller usually
//! needs no follow-up query.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::sync::{mpsc, oneshot};
use futures::{Async, Future, Poll, Stream};
use log::{debug, warn};
use rand::{thread_rng, Rng};
use tokio_core::reactor::{Handle, Timeout};

use crate::error::{Error, Result};
use crate::name::Name;
use crate::proto::{validate_response_flags, RecordType, CLASS_IN};
use crate::transport::Transport;
use crate::wire::{self, Message, RData, RecordKey, ResourceRecord};

/// Instructions from the public facade to the querier engine.
pub enum QuerierCommand {
    Query {
        name: Name,
        rtype: RecordType,
        window: Duration,
        done: oneshot::Sender<QueryResponse>,
    },
    Shutdown,
}

/// Everything collected for one query.
#[derive(Clone, Debug, Default)]
pub struct QueryResponse {
    /// Deduplicated records, answers first, in arrival order.
    pub records: Vec<ResourceRecord>,
}

impl QueryResponse {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every IPv4 address carried in A records.
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.records
            .iter()
            .filter_map(|rec| match rec.rdata {
                RData::A(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    /// The port of the first SRV record, if any arrived.
    pub fn port(&self) -> Option<u16> {
        self.records.iter().find_map(|rec| match rec.rdata {
            RData::Srv { port, .. } => Some(port),
            _ => None,
        })
    }

    /// Targets of PTR records, useful after a service-type browse.
    pub fn pointers(&self) -> Vec<Name> {
        self.records
            .iter()
            .filter_map(|rec| match &rec.rdata {
                RData::Ptr(target) => Some(target.clone()),
                _ => None,
            })
            .collect()
    }
}

struct PendingQuery {
    name: Name,
    rtype: RecordType,
    timer: Timeout,
    seen: Vec<RecordKey>,
    records: Vec<ResourceRecord>,
    done: oneshot::Sender<QueryResponse>,
}

impl PendingQuery {
    /// True if `rec` directly answers this question.
    fn answers(&self, rec: &ResourceRecord) -> bool {
        rec.name == self.name
            && (self.rtype == RecordType::Any || rec.rtype == self.rtype.to_u16())
    }

    fn absorb(&mut self, rec: &ResourceRecord) {
        let key = rec.key();
        if !self.seen.contains(&key) {
            self.seen.push(key);
            self.records.push(rec.clone());
        }
    }
}

/// The querier engine future.
pub struct QuerierFsm<T: Transport> {
    transport: T,
    commands: mpsc::UnboundedReceiver<QuerierCommand>,
    pending: Vec<PendingQuery>,
    outgoing: VecDeque<(Vec<u8>, SocketAddr)>,
    handle: Handle,
}

impl<T: Transport> QuerierFsm<T> {
    pub fn new(
        handle: &Handle,
        transport: T,
    ) -> (QuerierFsm<T>, mpsc::UnboundedSender<QuerierCommand>) {
        let (tx, rx) = mpsc::unbounded();
        let fsm = QuerierFsm {
            transport,
            commands: rx,
            pending: Vec::new(),
            outgoing: VecDeque::new(),
            handle: handle.clone(),
        };
        (fsm, tx)
    }

    fn handle_command(&mut self, command: QuerierCommand) -> Result<bool> {
        match command {
            QuerierCommand::Query {
                name,
                rtype,
                window,
                done,
            } => {
                self.start_query(name, rtype, window, done)?;
                Ok(false)
            }
            QuerierCommand::Shutdown => Ok(true),
        }
    }

    fn start_query(
        &mut self,
        name: Name,
        rtype: RecordType,
        window: Duration,
        done: oneshot::Sender<QueryResponse>,
    ) -> Result<()> {
        let id = thread_rng().gen::<u16>();
        let message = Message::query(id, name.clone(), rtype.to_u16(), CLASS_IN);
        let dest = self.transport.multicast_dest();
        self.outgoing.push_back((message.to_bytes(), dest));
        debug!("query {} {} for {:?}", rtype, name, window);

        let timer =
            Timeout::new(window, &self.handle).map_err(|e| Error::network("timer", e))?;
        self.pending.push(PendingQuery {
            name,
            rtype,
            timer,
            seen: Vec::new(),
            records: Vec::new(),
            done,
        });
        Ok(())
    }

    fn recv_packets(&mut self) -> Result<()> {
        loop {
            match self.transport.recv_from()? {
                Some((data, _src)) => self.handle_response(&data),
                None => return Ok(()),
            }
        }
    }

    fn handle_response(&mut self, data: &[u8]) {
        let message = match wire::parse(data) {
            Ok(message) => message,
            Err(err) => {
                debug!("ignoring packet: {}", err);
                return;
            }
        };
        // The message ID is deliberately not checked: responses to
        // multicast questions carry ID zero (RFC 6762 §18.1).
        if !message.is_response() || !validate_response_flags(message.header.flags) {
            return;
        }

        for pending in &mut self.pending {
            let answered: Vec<&ResourceRecord> = message
                .answers
                .iter()
                .filter(|rec| pending.answers(rec))
                .collect();
            if answered.is_empty() {
                continue;
            }
            for rec in answered {
                pending.absorb(rec);
            }
            // The correlated additionals ride along.
            for rec in &message.additionals {
                pending.absorb(rec);
            }
        }
    }

    fn drive_pending(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.pending.len() {
            let expired = {
                let pending = &mut self.pending[i];
                match pending.timer.poll() {
                    Ok(Async::NotReady) => false,
                    Ok(Async::Ready(())) => true,
                    Err(err) => return Err(Error::network("timer", err)),
                }
            };
            if expired {
                let pending = self.pending.remove(i);
                let response = QueryResponse {
                    records: pending.records,
                };
                debug!(
                    "query window for {} closed with {} records",
                    pending.name,
                    response.records.len()
                );
                // A dropped caller is its own cancellation.
                let _ = pending.done.send(response);
            } else {
                i += 1;
            }
        }
        Ok(())
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
                    warn!("send to {} failed: {}", dest, err);
                }
            }
        }
        Ok(())
    }
}

impl<T: Transport> Future for QuerierFsm<T> {
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
                    debug!("all querier handles dropped; engine stopping");
                    return Ok(Async::Ready(()));
                }
                Ok(Async::NotReady) | Err(()) => break,
            }
        }

        self.recv_packets()?;
        self.drive_pending()?;
        self.send_pending()?;
        Ok(Async::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::record;

    fn pending(name: &str, rtype: RecordType) -> PendingQuery {
        // A timer is required by the struct but never polled in these
        // tests; any reactor works.
        let core = tokio_core::reactor::Core::new().unwrap();
        let (done, _rx) = oneshot::channel();
        PendingQuery {
            name: Name::from_str(name).unwrap(),
            rtype,
            timer: Timeout::new(Duration::from_secs(1), &core.handle()).unwrap(),
            seen: Vec::new(),
            records: Vec::new(),
            done,
        }
    }

    fn ptr(owner: &str, target: &str) -> ResourceRecord {
        record(
            Name::from_str(owner).unwrap(),
            RecordType::Ptr,
            false,
            4500,
            RData::Ptr(Name::from_str(target).unwrap()),
        )
    }

    #[test]
    fn question_matching() {
        let q = pending("_http._tcp.local", RecordType::Ptr);
        assert!(q.answers(&ptr("_http._TCP.local", "A._http._tcp.local")));
        assert!(!q.answers(&ptr("_ipp._tcp.local", "B._ipp._tcp.local")));

        let any = pending("_http._tcp.local", RecordType::Any);
        assert!(any.answers(&ptr("_http._tcp.local", "A._http._tcp.local")));
    }

    #[test]
    fn absorb_deduplicates() {
        let mut q = pending("_http._tcp.local", RecordType::Ptr);
        let rec = ptr("_http._tcp.local", "A._http._tcp.local");
        q.absorb(&rec);
        q.absorb(&rec);
        assert_eq!(q.records.len(), 1);

        let other = ptr("_http._tcp.local", "B._http._tcp.local");
        q.absorb(&other);
        assert_eq!(q.records.len(), 2);
    }

    #[test]
    fn response_accessors() {
        let response = QueryResponse {
            records: vec![
                ptr("_http._tcp.local", "A._http._tcp.local"),
                record(
                    Name::from_str("A._http._tcp.local").unwrap(),
                    RecordType::Srv,
                    true,
                    120,
                    RData::Srv {
                        priority: 0,
                        weight: 0,
                        port: 8080,
                        target: Name::from_str("host.local").unwrap(),
                    },
                ),
                record(
                    Name::from_str("host.local").unwrap(),
                    RecordType::A,
                    true,
                    120,
                    RData::A(Ipv4Addr::new(192, 168, 1, 4)),
                ),
            ],
        };
        assert_eq!(response.port(), Some(8080));
        assert_eq!(response.addresses(), vec![Ipv4Addr::new(192, 168, 1, 4)]);
        assert_eq!(response.pointers().len(), 1);
        assert!(!response.is_empty());
    }
}
