//! Handle transport between the exporting and the importing process.
//!
//! The exporter opens a one-shot server and publishes its name. The importer
//! connects to it and hands over its ends of two fresh channels: one for
//! offers flowing to the importer, one for reports flowing back.

use ipc_channel::ipc::{self, IpcOneShotServer, IpcReceiver, IpcSender};
use thiserror::Error;

use crate::protocol::AttachReport;
use crate::protocol::SharedBuffer;

type Handshake = (IpcSender<SharedBuffer>, IpcReceiver<AttachReport>);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("IPC error: {0}")]
    Ipc(#[from] ipc_channel::Error),
    #[error("IPC recv error: {0}")]
    IpcRecv(#[from] ipc_channel::ipc::IpcError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A published exporter endpoint that no importer has connected to yet.
pub struct PendingExporter {
    server: IpcOneShotServer<Handshake>,
}

impl PendingExporter {
    /// Blocks until an importer connects.
    pub fn accept(self) -> Result<ExporterChannel, ChannelError> {
        let (_, (offers, reports)) = self.server.accept()?;
        Ok(ExporterChannel { offers, reports })
    }
}

/// Exporter side: sends offers, receives reports.
#[derive(Debug)]
pub struct ExporterChannel {
    offers: IpcSender<SharedBuffer>,
    reports: IpcReceiver<AttachReport>,
}

impl ExporterChannel {
    /// Creates a server endpoint an importer can connect to.
    /// Returns the pending endpoint and the name to share with the importer.
    pub fn listen() -> Result<(PendingExporter, String), ChannelError> {
        let (server, name) = IpcOneShotServer::new()?;
        Ok((PendingExporter { server }, name))
    }

    /// Connected exporter and importer ends within one process.
    pub fn pair() -> Result<(ExporterChannel, ImporterChannel), ChannelError> {
        let (offer_tx, offer_rx) = ipc::channel()?;
        let (report_tx, report_rx) = ipc::channel()?;
        Ok((
            ExporterChannel {
                offers: offer_tx,
                reports: report_rx,
            },
            ImporterChannel {
                offers: offer_rx,
                reports: report_tx,
            },
        ))
    }

    pub fn offer(&self, buffer: SharedBuffer) -> Result<(), ChannelError> {
        self.offers.send(buffer)?;
        Ok(())
    }

    /// Blocks until the importer reports back.
    pub fn wait_report(&self) -> Result<AttachReport, ChannelError> {
        Ok(self.reports.recv()?)
    }
}

/// Importer side: receives offers, sends reports.
#[derive(Debug)]
pub struct ImporterChannel {
    offers: IpcReceiver<SharedBuffer>,
    reports: IpcSender<AttachReport>,
}

impl ImporterChannel {
    /// Connects to an exporter published under `server_name`.
    /// This should be used in a different process than the one that called `listen`.
    pub fn connect<S: ToString>(server_name: S) -> Result<Self, ChannelError> {
        let server = IpcSender::<Handshake>::connect(server_name.to_string())?;

        let (offer_tx, offer_rx) = ipc::channel()?;
        let (report_tx, report_rx) = ipc::channel()?;

        server.send((offer_tx, report_rx))?;

        Ok(Self {
            offers: offer_rx,
            reports: report_tx,
        })
    }

    pub fn receive_offer(&self) -> Result<SharedBuffer, ChannelError> {
        Ok(self.offers.recv()?)
    }

    pub fn report(&self, report: AttachReport) -> Result<(), ChannelError> {
        self.reports.send(report)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use cuda_api::EventHandle;
    use cuda_api::MemoryHandle;
    use similar_asserts::assert_eq;

    use super::*;

    fn offer() -> SharedBuffer {
        SharedBuffer {
            memory: MemoryHandle::from_bytes([3; 64]),
            ready: EventHandle::from_bytes([4; 64]),
            len: 4096,
            pattern: 0xa5,
            device: 0,
            exporter_pid: std::process::id(),
        }
    }

    #[test]
    fn paired_channels_carry_offer_and_report() {
        let (exporter, importer) = ExporterChannel::pair().unwrap();

        let peer = thread::spawn(move || {
            let received = importer.receive_offer().unwrap();
            importer
                .report(AttachReport::Verified { len: received.len })
                .unwrap();
            received
        });

        exporter.offer(offer()).unwrap();
        assert_eq!(
            exporter.wait_report().unwrap(),
            AttachReport::Verified { len: 4096 }
        );
        assert_eq!(peer.join().unwrap(), offer());
    }

    #[test]
    fn importer_connects_by_server_name() {
        let (pending, name) = ExporterChannel::listen().unwrap();

        let peer = thread::spawn(move || {
            let importer = ImporterChannel::connect(name).unwrap();
            let received = importer.receive_offer().unwrap();
            importer
                .report(AttachReport::Failed(format!("pattern {:#x}", received.pattern)))
                .unwrap();
        });

        let exporter = pending.accept().unwrap();
        exporter.offer(offer()).unwrap();
        assert_eq!(
            exporter.wait_report().unwrap(),
            AttachReport::Failed("pattern 0xa5".to_string())
        );
        peer.join().unwrap();
    }

    #[test]
    fn dropped_importer_surfaces_as_recv_error() {
        let (exporter, importer) = ExporterChannel::pair().unwrap();
        drop(importer);

        assert!(matches!(
            exporter.wait_report(),
            Err(ChannelError::IpcRecv(_))
        ));
    }
}
