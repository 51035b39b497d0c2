//! The two halves of a sharing session, independent of how the processes
//! reach each other.

use cuda_api::memory;
use cuda_api::Device;
use cuda_api::DeviceBuffer;
use cuda_api::Event;
use cuda_api::ImportedEvent;
use cuda_api::ImportedMemory;
use cuda_api::PrimaryContext;
use cuda_api::Runtime;
use cuda_api::Stream;
use cuda_api::StreamFlags;
use std::collections::TryReserveError;

use thiserror::Error;
use tracing::info;
use tracing::warn;

use crate::channel::ChannelError;
use crate::channel::ExporterChannel;
use crate::channel::ImporterChannel;
use crate::protocol::AttachReport;
use crate::protocol::SharedBuffer;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("CUDA error: {0}")]
    Cuda(#[from] cuda_api::Error),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Cannot buffer an offer of {len} bytes on the host: {source}")]
    HostBuffer {
        len: usize,
        #[source]
        source: TryReserveError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeOptions {
    pub device: u32,
    pub size: usize,
    pub pattern: u8,
}

/// Exporter-side resources that must outlive the importer's use of them.
#[derive(Debug)]
pub struct Export {
    pub offer: SharedBuffer,
    // dropped in declaration order, the context last
    _ready: Event,
    _buffer: DeviceBuffer,
    _stream: Stream,
    _context: PrimaryContext,
}

/// Allocates and fills a buffer, and exports it together with an event that
/// completes when the fill has.
pub fn prepare_export(runtime: &Runtime, options: &ServeOptions) -> Result<Export, SessionError> {
    let device = Device::get(runtime, options.device)?;
    let context = device.primary_context()?;

    let stream = Stream::new(runtime, StreamFlags::NON_BLOCKING)?;
    let buffer = DeviceBuffer::new(runtime, options.size)?;
    let ready = Event::new_interprocess(runtime)?;

    buffer.fill_async(options.pattern, &stream)?;
    ready.record(&stream)?;

    let offer = SharedBuffer {
        memory: buffer.export()?,
        ready: ready.export()?,
        len: buffer.len(),
        pattern: options.pattern,
        device: options.device,
        exporter_pid: std::process::id(),
    };
    info!(
        device = options.device,
        bytes = offer.len,
        memory_handle = %offer.memory,
        "exported device buffer"
    );

    Ok(Export {
        offer,
        _ready: ready,
        _buffer: buffer,
        _stream: stream,
        _context: context,
    })
}

/// Offers an export to a connected importer and waits for its verdict. The
/// buffer stays mapped until the report arrives.
pub fn serve(channel: &ExporterChannel, export: &Export) -> Result<AttachReport, SessionError> {
    channel.offer(export.offer.clone())?;
    let report = channel.wait_report()?;
    match &report {
        AttachReport::Verified { len } => info!(bytes = len, "importer verified the buffer"),
        other => warn!(report = ?other, "importer did not verify the buffer"),
    }
    Ok(report)
}

/// Maps an offered buffer on `device`, waits for the exporter's event and
/// checks the contents.
pub fn inspect_offer(
    runtime: &Runtime,
    device: u32,
    offer: &SharedBuffer,
) -> Result<AttachReport, SessionError> {
    // peer-supplied length: reserve fallibly before any driver call
    let mut contents = Vec::new();
    contents
        .try_reserve_exact(offer.len)
        .map_err(|source| SessionError::HostBuffer {
            len: offer.len,
            source,
        })?;
    contents.resize(offer.len, 0u8);

    let _context = Device::get(runtime, device)?.primary_context()?;

    let ready = ImportedEvent::open(runtime, &offer.ready)?;
    let stream = Stream::new(runtime, StreamFlags::NON_BLOCKING)?;
    stream.wait_event(&ready)?;

    let imported = ImportedMemory::<u8>::new(runtime, &offer.memory)?;
    // SAFETY: `contents` is neither touched nor dropped before the stream is synchronized.
    unsafe { memory::copy_to_host_async(&stream, &mut contents, imported.get())? };
    stream.synchronize()?;
    imported.unmap()?;

    Ok(AttachReport::inspect(&contents, offer.pattern))
}

/// Importer side of a session: receive, inspect, report. Failures to map
/// or read the buffer are reported to the exporter before being returned.
pub fn attach(
    runtime: &Runtime,
    device: u32,
    channel: &ImporterChannel,
) -> Result<AttachReport, SessionError> {
    let offer = channel.receive_offer()?;
    info!(
        exporter_pid = offer.exporter_pid,
        bytes = offer.len,
        "received buffer offer"
    );

    match inspect_offer(runtime, device, &offer) {
        Ok(report) => {
            channel.report(report.clone())?;
            Ok(report)
        }
        Err(e) => {
            if let Err(send_err) = channel.report(AttachReport::Failed(e.to_string())) {
                warn!(error = %send_err, "could not report the failure to the exporter");
            }
            Err(e)
        }
    }
}
