//! Kernel-side producer: loads the HTTP program with aya, exposes its batch
//! map as [`BatchStorage`] and forwards perf-buffer doorbells.
//!
//! All code is gated behind `#[cfg(feature = "bpf")]`.

use std::fmt::Write as _;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::{MapData, MapError};
use aya::programs::{SocketFilter, TracePoint};
use aya::util::{nr_cpus, online_cpus};
use aya::{Ebpf, EbpfLoader};
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Producer, ProducerChannels};
use crate::config::BpfConfig;
use crate::http::batch::BatchStorage;
use crate::http::error::StorageError;
use crate::http::parse::{parse_batch, parse_notification, HTTP_BATCH_WIRE_SIZE, NOTIFICATION_SIZE};
use crate::http::types::{BatchKey, BatchNotification, HttpBatch, LostNotification};

const MAP_BATCHES: &str = "http_batches";
const MAP_NOTIFICATIONS: &str = "http_notifications";
const PROG_SOCKET_FILTER: &str = "socket__http_filter";
const PROG_NETIF_RECEIVE: &str = "tracepoint__net__netif_receive_skb";

/// Perf buffers drained per read.
const READ_BUFFERS: usize = 16;

/// BPF map key for http_batches (matches `struct http_batch_key_t`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct BpfBatchKey {
    cpu: u32,
    num: u32,
}

// SAFETY: BpfBatchKey is a plain C struct of two u32 fields, no padding.
unsafe impl aya::Pod for BpfBatchKey {}

/// BPF map value for http_batches, decoded by `parse_batch`.
#[repr(C)]
#[derive(Clone, Copy)]
struct BpfBatchValue([u8; HTTP_BATCH_WIRE_SIZE]);

// SAFETY: BpfBatchValue is a plain byte array.
unsafe impl aya::Pod for BpfBatchValue {}

/// Readers waiting for `start`.
struct PendingReaders {
    perf: AsyncPerfEventArray<MapData>,
    notify_tx: mpsc::Sender<BatchNotification>,
    lost_tx: mpsc::Sender<LostNotification>,
}

/// BPF-backed producer implementation.
pub struct BpfProducer {
    object_path: PathBuf,
    queue_size: usize,
    ebpf: Option<Ebpf>,
    socket: Option<OwnedFd>,
    pending: Option<PendingReaders>,
    readers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl BpfProducer {
    pub fn new(cfg: &BpfConfig) -> Self {
        Self {
            object_path: cfg.object_path.clone(),
            queue_size: cfg.notification_queue_size,
            ebpf: None,
            socket: None,
            pending: None,
            readers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

impl Producer for BpfProducer {
    fn open(&mut self) -> Result<ProducerChannels> {
        let mut ebpf = EbpfLoader::new()
            .load_file(&self.object_path)
            .with_context(|| format!("loading BPF object {}", self.object_path.display()))?;

        self.socket = Some(attach_programs(&mut ebpf)?);

        let batches_map = ebpf
            .take_map(MAP_BATCHES)
            .ok_or_else(|| anyhow!("{MAP_BATCHES} map not found"))?;
        let batches: BpfHashMap<MapData, BpfBatchKey, BpfBatchValue> =
            BpfHashMap::try_from(batches_map).context("opening http_batches map")?;

        let notifications_map = ebpf
            .take_map(MAP_NOTIFICATIONS)
            .ok_or_else(|| anyhow!("{MAP_NOTIFICATIONS} map not found"))?;
        let perf = AsyncPerfEventArray::try_from(notifications_map)
            .context("opening http_notifications perf array")?;

        let num_cpus = nr_cpus()
            .map_err(|(path, e)| anyhow!("reading {path}: {e}"))
            .context("counting possible cpus")?;

        let (notify_tx, notifications) = mpsc::channel(self.queue_size);
        let (lost_tx, lost) = mpsc::channel(self.queue_size);
        self.pending = Some(PendingReaders {
            perf,
            notify_tx,
            lost_tx,
        });
        self.ebpf = Some(ebpf);

        tracing::info!(
            object = %self.object_path.display(),
            num_cpus,
            "BPF HTTP program loaded",
        );

        Ok(ProducerChannels {
            storage: Box::new(BpfStorage { map: batches }),
            notifications,
            lost,
            num_cpus,
        })
    }

    fn start(&mut self) -> Result<()> {
        let mut pending = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("BPF producer not opened"))?;

        let cpus = online_cpus()
            .map_err(|(path, e)| anyhow!("reading {path}: {e}"))
            .context("listing online cpus")?;

        for cpu in cpus {
            let buf = pending
                .perf
                .open(cpu, None)
                .with_context(|| format!("opening perf buffer for cpu {cpu}"))?;

            self.readers.push(tokio::spawn(read_loop(
                buf,
                cpu,
                pending.notify_tx.clone(),
                pending.lost_tx.clone(),
                self.cancel.child_token(),
            )));
        }

        tracing::info!(readers = self.readers.len(), "BPF HTTP producer started");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        self.pending = None;

        for handle in self.readers.drain(..) {
            handle.await.context("waiting for perf reader")?;
        }

        // Dropping the Ebpf object detaches all programs and closes maps.
        self.ebpf = None;
        self.socket = None;

        tracing::info!("BPF HTTP producer stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Batch storage
// ---------------------------------------------------------------------------

struct BpfStorage {
    map: BpfHashMap<MapData, BpfBatchKey, BpfBatchValue>,
}

impl BatchStorage for BpfStorage {
    fn lookup(&self, key: BatchKey) -> Result<HttpBatch, StorageError> {
        let bpf_key = BpfBatchKey {
            cpu: key.cpu,
            num: key.num,
        };
        match self.map.get(&bpf_key, 0) {
            Ok(value) => Ok(parse_batch(&value.0)?),
            Err(MapError::KeyNotFound) => Err(StorageError::NotFound {
                cpu: key.cpu,
                num: key.num,
            }),
            Err(e) => Err(StorageError::Read(e.to_string())),
        }
    }

    fn dump(&self) -> Result<String> {
        let mut out = String::new();
        for entry in self.map.iter() {
            let (key, value) = entry.context("iterating http_batches")?;
            match parse_batch(&value.0) {
                Ok(batch) => writeln!(
                    out,
                    "cpu={} num={} idx={} pos={}",
                    key.cpu, key.num, batch.idx, batch.pos
                )?,
                Err(e) => writeln!(out, "cpu={} num={} error={e}", key.cpu, key.num)?,
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Perf buffer read loop
// ---------------------------------------------------------------------------

async fn read_loop(
    mut buf: AsyncPerfEventArrayBuffer<MapData>,
    cpu: u32,
    notify_tx: mpsc::Sender<BatchNotification>,
    lost_tx: mpsc::Sender<LostNotification>,
    cancel: CancellationToken,
) {
    let mut buffers: Vec<BytesMut> = (0..READ_BUFFERS)
        .map(|_| BytesMut::with_capacity(NOTIFICATION_SIZE * 4))
        .collect();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = buf.read_events(&mut buffers) => {
                let events = match result {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(cpu, error = %e, "perf buffer read error");
                        continue;
                    }
                };

                for data in buffers.iter().take(events.read) {
                    match parse_notification(data) {
                        Ok((cpu, idx)) => {
                            if notify_tx.send(BatchNotification { cpu, idx }).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(cpu, error = %e, "notification parse error");
                        }
                    }
                }

                for _ in 0..events.lost {
                    if lost_tx.send(LostNotification { cpu }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BPF program attachment
// ---------------------------------------------------------------------------

/// Attach the socket filter to a raw packet socket and the receive
/// tracepoint. Returns the socket, which must outlive the filter.
fn attach_programs(ebpf: &mut Ebpf) -> Result<OwnedFd> {
    let socket = open_packet_socket().context("opening raw packet socket")?;

    let filter: &mut SocketFilter = ebpf
        .program_mut(PROG_SOCKET_FILTER)
        .ok_or_else(|| anyhow!("{PROG_SOCKET_FILTER} program not found"))?
        .try_into()
        .with_context(|| format!("{PROG_SOCKET_FILTER} is not a socket filter"))?;
    filter
        .load()
        .with_context(|| format!("loading {PROG_SOCKET_FILTER}"))?;
    filter
        .attach(&socket)
        .with_context(|| format!("attaching {PROG_SOCKET_FILTER}"))?;
    tracing::debug!(program = PROG_SOCKET_FILTER, "attached socket filter");

    attach_tracepoint(ebpf, PROG_NETIF_RECEIVE, "net", "netif_receive_skb")?;

    Ok(socket)
}

fn attach_tracepoint(ebpf: &mut Ebpf, prog_name: &str, group: &str, name: &str) -> Result<()> {
    let prog: &mut TracePoint = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow!("{prog_name} program not found"))?
        .try_into()
        .with_context(|| format!("{prog_name} is not a tracepoint"))?;
    prog.load().with_context(|| format!("loading {prog_name}"))?;
    prog.attach(group, name)
        .with_context(|| format!("attaching {prog_name} to {group}/{name}"))?;
    tracing::debug!(program = prog_name, group, name, "attached tracepoint");
    Ok(())
}

fn open_packet_socket() -> Result<OwnedFd> {
    let protocol = (libc::ETH_P_ALL as u16).to_be();
    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::c_int::from(protocol),
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: fd is a freshly created descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
