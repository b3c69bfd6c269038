mod config;
mod dispatch;
mod logging;
mod requests;
mod wire;

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use sqlgate_db::Executor;

use config::{WorkerConfig, ensure_db_parent};
use dispatch::{Dispatcher, RequestObserver};
use wire::{
    DecodedRequest, ResponseEnvelope, WireCodec, decode_request, encode_response, read_frame,
    write_frame,
};

type Outgoing = (WireCodec, ResponseEnvelope);

fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::parse();
    logging::init_logging(config.debug, &config.log_file())?;

    ensure_db_parent(&config.db_path).with_context(|| {
        format!("failed to create directory for {}", config.db_path.display())
    })?;
    let executor = Executor::open(config.executor_config())
        .context("failed to open database")?
        .with_observer(Arc::new(RequestObserver));
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(executor)));

    let thread_count = config.thread_count();
    tracing::info!(
        db_path = %config.db_path.display(),
        threads = thread_count,
        max_queue = config.max_queue,
        pool_size = dispatcher.executor().pool().max_size(),
        "sqlgate worker ready"
    );

    let (request_tx, request_rx) = bounded::<DecodedRequest>(config.max_queue.max(1));
    let (response_tx, response_rx) = bounded::<Outgoing>(config.max_queue.max(1));

    let mut workers = Vec::with_capacity(thread_count);
    for idx in 0..thread_count {
        let request_rx = request_rx.clone();
        let response_tx = response_tx.clone();
        let dispatcher = dispatcher.clone();
        let handle = thread::Builder::new()
            .name(format!("sqlgate-worker-{idx}"))
            .spawn(move || worker_loop(request_rx, response_tx, dispatcher))
            .context("failed to spawn worker thread")?;
        workers.push(handle);
    }
    drop(request_rx);

    let writer = thread::Builder::new()
        .name("sqlgate-writer".to_string())
        .spawn(move || write_loop(response_rx, io::stdout()))
        .context("failed to spawn writer thread")?;

    read_loop(&mut io::stdin().lock(), &request_tx, &response_tx);

    drop(request_tx);
    for worker in workers {
        let _ = worker.join();
    }
    drop(response_tx);
    let _ = writer.join();
    tracing::info!("sqlgate worker stopped");
    Ok(())
}

/// Reads frames until EOF, queueing requests for the worker threads. A full
/// queue answers `Busy` immediately.
fn read_loop<R: io::Read>(
    reader: &mut R,
    request_tx: &Sender<DecodedRequest>,
    response_tx: &Sender<Outgoing>,
) {
    loop {
        let frame = match read_frame(reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(error = %err, "failed to read frame");
                let _ = response_tx.send((
                    WireCodec::Json,
                    ResponseEnvelope::error(0, "InvalidInput", err.to_string()),
                ));
                break;
            }
        };
        let decoded = match decode_request(&frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable request");
                let _ = response_tx.send((WireCodec::Json, ResponseEnvelope::error(0, "InvalidInput", err)));
                continue;
            }
        };
        match request_tx.try_send(decoded) {
            Ok(()) => {}
            Err(TrySendError::Full(request)) => {
                tracing::warn!(request_id = request.envelope.request_id, "worker queue full");
                let _ = response_tx.send((
                    request.wire,
                    ResponseEnvelope::error(request.envelope.request_id, "Busy", "Worker queue full"),
                ));
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
}

fn worker_loop(
    request_rx: Receiver<DecodedRequest>,
    response_tx: Sender<Outgoing>,
    dispatcher: Arc<Dispatcher>,
) {
    while let Ok(request) = request_rx.recv() {
        let queue_depth = request_rx.len();
        for outgoing in dispatcher.handle(request, queue_depth) {
            if response_tx.send(outgoing).is_err() {
                return;
            }
        }
    }
}

fn write_loop<W: Write>(response_rx: Receiver<Outgoing>, mut writer: W) {
    while let Ok((wire, response)) = response_rx.recv() {
        let encoded = match encode_response(&response, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(request_id = response.request_id, error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded) {
            tracing::error!(error = %err, "failed to write response");
            break;
        }
    }
}
