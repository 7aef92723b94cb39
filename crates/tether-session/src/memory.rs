//! In-process discovery medium.
//!
//! Every `MemoryDevice` handed out by one `MemoryMedium` can see and dial
//! every other device advertising the same service with the same secret.
//! Links are `tokio::io::duplex` pipes. The medium also injects the faults
//! a real radio produces: a device that stops transmitting or sends garbage,
//! a path waiting for connectivity, handshakes that never finish, and an
//! advertisement that disappears.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures::{ready, FutureExt};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot, watch};

use tether_core::auth::ServiceParams;
use tether_core::wire::{ServiceHash, FRAME_HEADER_LEN, PING};
use tether_core::{EndpointId, PeerIdentity};

use crate::transport::{
    Candidate, Connected, DiscoveryError, DiscoverySource, InboundLink, PathStatus, PendingLink,
    Subscription, TransportError,
};

/// Buffer of each duplex pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Inbound links queued per listener.
const ACCEPT_BACKLOG: usize = 16;

type DeviceId = u64;

/// Distinguishes services that share a name but not a secret.
type Fingerprint = [u8; 32];

fn fingerprint(service: &ServiceParams) -> Fingerprint {
    service.auth().tag(&[&b"memory medium"[..], &service.hash()[..]])
}

#[derive(Clone, Default)]
pub struct MemoryMedium {
    state: Arc<Mutex<MediumState>>,
}

#[derive(Default)]
struct MediumState {
    next_id: u64,
    stall: bool,
    devices: HashMap<DeviceId, DeviceState>,
    adverts: BTreeMap<EndpointId, Advert>,
    listeners: HashMap<(DeviceId, ServiceHash), Listener>,
    scanners: HashMap<u64, Scanner>,
}

struct DeviceState {
    /// Last identity this device advertised; faults are addressed by it.
    identity: Option<PeerIdentity>,
    muted: Arc<AtomicBool>,
    /// Bumped once per `garble`; each stream sends one bad frame per bump.
    garbled: Arc<AtomicU64>,
    path: watch::Sender<PathStatus>,
}

impl DeviceState {
    fn stream(&self, inner: DuplexStream) -> MemoryStream {
        MemoryStream {
            inner,
            muted: self.muted.clone(),
            garbled: self.garbled.clone(),
            garbled_seen: self.garbled.load(Ordering::SeqCst),
            pending: Vec::new(),
        }
    }
}

struct Advert {
    device: DeviceId,
    identity: PeerIdentity,
    service: ServiceHash,
    fingerprint: Fingerprint,
}

struct Listener {
    id: u64,
    fingerprint: Fingerprint,
    tx: mpsc::Sender<InboundLink>,
}

struct Scanner {
    device: DeviceId,
    service: ServiceHash,
    fingerprint: Fingerprint,
    tx: watch::Sender<Vec<Candidate>>,
}

impl MediumState {
    fn mint(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn candidates_for(&self, scanner: &Scanner) -> Vec<Candidate> {
        self.adverts
            .iter()
            .filter(|(_, a)| {
                a.device != scanner.device
                    && a.service == scanner.service
                    && a.fingerprint == scanner.fingerprint
            })
            .map(|(endpoint, a)| Candidate {
                endpoint: endpoint.clone(),
                identity: a.identity.clone(),
            })
            .collect()
    }

    fn refresh_scanners(&self) {
        for scanner in self.scanners.values() {
            let next = self.candidates_for(scanner);
            scanner.tx.send_if_modified(|current| {
                if *current == next {
                    return false;
                }
                *current = next;
                true
            });
        }
    }

    fn devices_named(&self, identity: &str) -> impl Iterator<Item = &DeviceState> + '_ {
        let identity = identity.to_string();
        self.devices
            .values()
            .filter(move |d| d.identity.as_ref().map(PeerIdentity::as_str) == Some(identity.as_str()))
    }
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new device on this medium. Devices stay registered for the life of
    /// the medium so faults survive session restarts.
    pub fn device(&self) -> MemoryDevice {
        let mut state = self.lock();
        let id = state.mint();
        let (path, _) = watch::channel(PathStatus::Viable);
        state.devices.insert(
            id,
            DeviceState {
                identity: None,
                muted: Arc::new(AtomicBool::new(false)),
                garbled: Arc::new(AtomicU64::new(0)),
                path,
            },
        );
        MemoryDevice {
            medium: self.clone(),
            id,
        }
    }

    /// Silently drop everything the named device writes. Its links stay open.
    pub fn mute(&self, identity: &str) {
        self.set_muted(identity, true);
    }

    pub fn unmute(&self, identity: &str) {
        self.set_muted(identity, false);
    }

    fn set_muted(&self, identity: &str, muted: bool) {
        for device in self.lock().devices_named(identity) {
            device.muted.store(muted, Ordering::SeqCst);
        }
    }

    /// Have the named device put one malformed frame on each of its open
    /// links, ahead of the next thing it writes there.
    pub fn garble(&self, identity: &str) {
        for device in self.lock().devices_named(identity) {
            device.garbled.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Report every link of the named device as waiting for connectivity,
    /// or viable again.
    pub fn set_waiting(&self, identity: &str, waiting: bool) {
        let status = if waiting {
            PathStatus::Waiting
        } else {
            PathStatus::Viable
        };
        for device in self.lock().devices_named(identity) {
            device.path.send_replace(status);
        }
    }

    /// While set, new dials never complete.
    pub fn stall_handshakes(&self, stall: bool) {
        self.lock().stall = stall;
    }

    /// Withdraw every advertisement of the named identity.
    pub fn vanish(&self, identity: &str) {
        let mut state = self.lock();
        state.adverts.retain(|_, a| a.identity.as_str() != identity);
        state.refresh_scanners();
    }

    /// Endpoints currently advertised, for assertions.
    pub fn advertised(&self) -> Vec<Candidate> {
        self.lock()
            .adverts
            .iter()
            .map(|(endpoint, a)| Candidate {
                endpoint: endpoint.clone(),
                identity: a.identity.clone(),
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, MediumState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MemoryMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryMedium")
            .field("devices", &state.devices.len())
            .field("adverts", &state.adverts.len())
            .finish()
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

/// One device's view of a `MemoryMedium`.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    medium: MemoryMedium,
    id: DeviceId,
}

impl DiscoverySource for MemoryDevice {
    fn advertise(
        &self,
        identity: &PeerIdentity,
        service: &ServiceParams,
    ) -> Result<Subscription, DiscoveryError> {
        let mut state = self.medium.lock();
        let taken = state
            .adverts
            .values()
            .any(|a| &a.identity == identity && a.service == *service.hash());
        if taken {
            return Err(DiscoveryError::IdentityInUse(identity.clone()));
        }

        let n = state.mint();
        let endpoint = EndpointId::new(format!("mem:{identity}#{n}"));
        state.adverts.insert(
            endpoint.clone(),
            Advert {
                device: self.id,
                identity: identity.clone(),
                service: *service.hash(),
                fingerprint: fingerprint(service),
            },
        );
        if let Some(device) = state.devices.get_mut(&self.id) {
            device.identity = Some(identity.clone());
        }
        state.refresh_scanners();
        tracing::debug!(endpoint = %endpoint, "memory advert published");

        let medium = self.medium.clone();
        Ok(Subscription::on_close(move || {
            let mut state = medium.lock();
            if state.adverts.remove(&endpoint).is_some() {
                state.refresh_scanners();
            }
        }))
    }

    fn start_scanning(
        &self,
        service: &ServiceParams,
    ) -> Result<(watch::Receiver<Vec<Candidate>>, Subscription), DiscoveryError> {
        let mut state = self.medium.lock();
        let id = state.mint();
        let (tx, rx) = watch::channel(Vec::new());
        let scanner = Scanner {
            device: self.id,
            service: *service.hash(),
            fingerprint: fingerprint(service),
            tx,
        };
        let initial = state.candidates_for(&scanner);
        scanner.tx.send_replace(initial);
        state.scanners.insert(id, scanner);

        let medium = self.medium.clone();
        let sub = Subscription::on_close(move || {
            medium.lock().scanners.remove(&id);
        });
        Ok((rx, sub))
    }

    fn dial(&self, endpoint: &EndpointId, service: &ServiceParams) -> PendingLink {
        connect(self.clone(), endpoint.clone(), *service.hash(), fingerprint(service)).boxed()
    }

    fn accept(
        &self,
        service: &ServiceParams,
    ) -> Result<(mpsc::Receiver<InboundLink>, Subscription), DiscoveryError> {
        let mut state = self.medium.lock();
        let id = state.mint();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let key = (self.id, *service.hash());
        state.listeners.insert(
            key,
            Listener {
                id,
                fingerprint: fingerprint(service),
                tx,
            },
        );

        let medium = self.medium.clone();
        let sub = Subscription::on_close(move || {
            let mut state = medium.lock();
            if state.listeners.get(&key).map(|l| l.id) == Some(id) {
                state.listeners.remove(&key);
            }
        });
        Ok((rx, sub))
    }
}

async fn connect(
    device: MemoryDevice,
    endpoint: EndpointId,
    service: ServiceHash,
    print: Fingerprint,
) -> Result<Connected, TransportError> {
    let stalled = device.medium.lock().stall;
    if stalled {
        return futures::future::pending().await;
    }

    let offer = device.offer(&endpoint, service, print)?;
    offer
        .listener
        .send(offer.inbound)
        .await
        .map_err(|_| TransportError::Unreachable(endpoint.clone()))?;
    offer.accepted.await.map_err(|_| TransportError::Rejected)?;
    Ok(Connected::from_stream(offer.stream, Some(offer.path)))
}

/// Dialer's half of a pipe whose other half is offered to the target.
struct Offer {
    listener: mpsc::Sender<InboundLink>,
    inbound: InboundLink,
    accepted: oneshot::Receiver<()>,
    stream: MemoryStream,
    path: watch::Receiver<PathStatus>,
}

impl MemoryDevice {
    fn offer(
        &self,
        endpoint: &EndpointId,
        service: ServiceHash,
        print: Fingerprint,
    ) -> Result<Offer, TransportError> {
        let state = self.medium.lock();
        let unreachable = || TransportError::Unreachable(endpoint.clone());

        let advert = state.adverts.get(endpoint).ok_or_else(unreachable)?;
        let listener = state
            .listeners
            .get(&(advert.device, service))
            .ok_or_else(unreachable)?;
        if advert.service != service || advert.fingerprint != print || listener.fingerprint != print
        {
            return Err(TransportError::Handshake("service secret mismatch".into()));
        }
        let (own_endpoint, own) = state
            .adverts
            .iter()
            .find(|(_, a)| a.device == self.id && a.service == service)
            .ok_or(TransportError::NotAdvertising)?;
        let ours = state.devices.get(&self.id).ok_or(TransportError::NotAdvertising)?;
        let theirs = state.devices.get(&advert.device).ok_or_else(unreachable)?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let far = theirs.stream(far);
        let far_path = theirs.path.subscribe();
        let (accepted_tx, accepted) = oneshot::channel();
        let inbound = InboundLink {
            endpoint: own_endpoint.clone(),
            peer: own.identity.clone(),
            connect: async move {
                let _ = accepted_tx.send(());
                Ok(Connected::from_stream(far, Some(far_path)))
            }
            .boxed(),
        };

        Ok(Offer {
            listener: listener.tx.clone(),
            inbound,
            accepted,
            stream: ours.stream(near),
            path: ours.path.subscribe(),
        })
    }
}

// ── Stream ────────────────────────────────────────────────────────────────────

/// A ping header announcing a payload, which no reader accepts.
fn malformed_frame() -> Vec<u8> {
    let mut bytes = vec![0u8; FRAME_HEADER_LEN];
    bytes[..4].copy_from_slice(&PING.to_be_bytes());
    bytes[4..].copy_from_slice(&1u32.to_be_bytes());
    bytes.push(0xff);
    bytes
}

/// Duplex pipe end whose writes vanish while its device is muted.
struct MemoryStream {
    inner: DuplexStream,
    muted: Arc<AtomicBool>,
    garbled: Arc<AtomicU64>,
    garbled_seen: u64,
    /// Injected bytes not yet written.
    pending: Vec<u8>,
}

impl MemoryStream {
    fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Write out any injected garbage before the caller's bytes.
    fn poll_injected(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let wanted = self.garbled.load(Ordering::SeqCst);
        if wanted != self.garbled_seen {
            self.garbled_seen = wanted;
            self.pending.extend_from_slice(&malformed_frame());
        }
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.muted() {
            return Poll::Ready(Ok(buf.len()));
        }
        ready!(self.poll_injected(cx))?;
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.muted() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.muted() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
