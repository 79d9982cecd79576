use std::{
    error, fmt,
    sync::{
        mpsc::{self, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use tracing::{debug, error, info};

use super::{graph::RenderGraph, AtomicF32};
use crate::engine::Transport;

pub type BufferTx = ringbuf::wrap::caching::Caching<
    Arc<ringbuf::SharedRb<ringbuf::storage::Heap<f32>>>,
    true,
    false,
>;
pub type BufferRx = ringbuf::wrap::caching::Caching<
    Arc<ringbuf::SharedRb<ringbuf::storage::Heap<f32>>>,
    false,
    true,
>;

const NUM_CHANNELS: u16 = 2;
const IDLE_WAIT: Duration = Duration::from_micros(500);

#[derive(Debug)]
pub enum Error {
    NoDefaultDevice,
    NoDefaultConfig,
    UnsupportedSampleFormat(cpal::SampleFormat),
    BuildStream(cpal::BuildStreamError),
    PlayStream(cpal::PlayStreamError),
    Thread(String),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NoDefaultDevice => write!(f, "No default output device."),
            Error::NoDefaultConfig => write!(f, "Output device has no default config."),
            Error::UnsupportedSampleFormat(format) => {
                write!(f, "Unsupported sample format: {format}")
            }
            Error::BuildStream(e) => write!(f, "Failed to build output stream: {e}"),
            Error::PlayStream(e) => write!(f, "Failed to start output stream: {e}"),
            Error::Thread(e) => write!(f, "Audio thread failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputParams {
    pub sample_rate: u32,
    pub buffer_size: usize,
}

impl Default for OutputParams {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 512,
        }
    }
}

/// Shared scalars the audio threads write for the control path to read.
#[derive(Clone)]
pub struct Taps {
    pub master_peak: Arc<AtomicF32>,
    pub cpu_load: Arc<AtomicF32>,
    pub transport: Arc<Transport>,
}

/// Hold and release for a running output, so topology edits never race the
/// audio threads.
pub trait OutputControl: Send {
    /// Returns once no audio thread is inside the graph.
    fn pause(&self);
    fn resume(&self);
    fn stop(self: Box<Self>);
}

/// Shared by both audio threads. `Pause` carries the acknowledgement sender.
enum Command {
    Pause(mpsc::Sender<()>),
    Resume,
    Stop,
}

/// A running device output. The device callback only pops samples from ring
/// buffers, a render thread keeps them filled from the graph.
pub struct AudioOutput {
    stream_commands: mpsc::Sender<Command>,
    render_commands: mpsc::Sender<Command>,
    stream_thread: Option<JoinHandle<()>>,
    render_thread: Option<JoinHandle<()>>,
}

impl AudioOutput {
    pub fn start(graph: RenderGraph, params: OutputParams, taps: Taps) -> Result<Self, Error> {
        let ((lbuf_tx, lbuf_rx), (rbuf_tx, rbuf_rx)) = create_buffers(params.buffer_size * 2);
        let (stream_commands, stream_command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let master_peak = Arc::clone(&taps.master_peak);
        let stream_thread = thread::Builder::new()
            .name("stagerack-stream".into())
            .spawn(move || {
                let stream = match create_default_stream(params, lbuf_rx, rbuf_rx, master_peak) {
                    Ok(stream) => {
                        _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_stream_commands(&stream, stream_command_rx);
            })
            .map_err(|e| Error::Thread(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|e| Error::Thread(e.to_string()))??;

        let (render_commands, render_command_rx) = mpsc::channel();
        let render_thread = thread::Builder::new()
            .name("stagerack-render".into())
            .spawn(move || {
                run_render_loop(graph, params, taps, lbuf_tx, rbuf_tx, render_command_rx);
            })
            .map_err(|e| Error::Thread(e.to_string()))?;

        info!(
            "Audio output started: {} Hz, {} frames",
            params.sample_rate, params.buffer_size
        );
        Ok(Self {
            stream_commands,
            render_commands,
            stream_thread: Some(stream_thread),
            render_thread: Some(render_thread),
        })
    }

    fn shutdown(&mut self) {
        _ = self.stream_commands.send(Command::Stop);
        _ = self.render_commands.send(Command::Stop);
        for handle in [self.stream_thread.take(), self.render_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                error!("Audio thread panicked");
            }
        }
        debug!("Audio output stopped");
    }
}

impl OutputControl for AudioOutput {
    fn pause(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        _ = self.render_commands.send(Command::Pause(ack_tx.clone()));
        _ = self.stream_commands.send(Command::Pause(ack_tx));
        // A thread that already exited drops its sender instead of answering.
        while ack_rx.recv().is_ok() {}
    }

    fn resume(&self) {
        _ = self.stream_commands.send(Command::Resume);
        _ = self.render_commands.send(Command::Resume);
    }

    fn stop(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        if self.stream_thread.is_some() || self.render_thread.is_some() {
            self.shutdown();
        }
    }
}

fn run_stream_commands(stream: &Stream, commands: mpsc::Receiver<Command>) {
    while let Ok(command) = commands.recv() {
        let result = match command {
            Command::Pause(ack) => {
                let result = stream.pause().map_err(|e| e.to_string());
                _ = ack.send(());
                result
            }
            Command::Resume => stream.play().map_err(|e| e.to_string()),
            Command::Stop => return,
        };
        if let Err(e) = result {
            error!("Output stream command failed: {e}");
        }
    }
}

fn run_render_loop(
    graph: RenderGraph,
    params: OutputParams,
    taps: Taps,
    mut lbuf_tx: BufferTx,
    mut rbuf_tx: BufferTx,
    commands: mpsc::Receiver<Command>,
) {
    let block = (params.buffer_size / 2).max(1);
    let block_time = block as f32 / params.sample_rate as f32;
    let mut lbuf = vec![0.0; block];
    let mut rbuf = vec![0.0; block];

    loop {
        match commands.try_recv() {
            Ok(Command::Pause(ack)) => {
                _ = ack.send(());
                if !hold_until_resumed(&commands) {
                    return;
                }
            }
            Ok(Command::Resume) | Err(TryRecvError::Empty) => {}
            Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return,
        }
        if lbuf_tx.vacant_len() < block || rbuf_tx.vacant_len() < block {
            thread::sleep(IDLE_WAIT);
            continue;
        }
        let start = Instant::now();
        graph.render(&mut lbuf, &mut rbuf);
        taps.cpu_load
            .store(start.elapsed().as_secs_f32() / block_time);
        taps.transport.advance(block as u64);
        lbuf_tx.push_slice(&lbuf);
        rbuf_tx.push_slice(&rbuf);
    }
}

/// Parks the render thread outside the graph. Returns false on stop.
fn hold_until_resumed(commands: &mpsc::Receiver<Command>) -> bool {
    loop {
        match commands.recv() {
            Ok(Command::Resume) => return true,
            Ok(Command::Pause(ack)) => {
                _ = ack.send(());
            }
            Ok(Command::Stop) | Err(_) => return false,
        }
    }
}

fn create_default_stream(
    params: OutputParams,
    lbuf_rx: BufferRx,
    rbuf_rx: BufferRx,
    master_peak: Arc<AtomicF32>,
) -> Result<Stream, Error> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(Error::NoDefaultDevice)?;
    if let Ok(name) = device.name() {
        debug!("Output device: {name} ({})", host.id().name());
    }
    let sample_format = sample_format(&device)?;
    let cfg = StreamConfig {
        channels: NUM_CHANNELS,
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: BufferSize::Fixed(params.buffer_size as u32),
    };
    create_stream_dispatched(StreamParams {
        sample_format,
        device,
        cfg,
        lbuf_rx,
        rbuf_rx,
        master_peak,
    })
}

struct StreamParams {
    sample_format: cpal::SampleFormat,
    device: Device,
    cfg: StreamConfig,
    lbuf_rx: BufferRx,
    rbuf_rx: BufferRx,
    master_peak: Arc<AtomicF32>,
}

fn sample_format(device: &Device) -> Result<SampleFormat, Error> {
    let config = device
        .default_output_config()
        .map_err(|_| Error::NoDefaultConfig)?;
    Ok(config.sample_format())
}

fn create_stream_dispatched(params: StreamParams) -> Result<Stream, Error> {
    match params.sample_format {
        cpal::SampleFormat::I8 => create_stream::<i8>(params),
        cpal::SampleFormat::I16 => create_stream::<i16>(params),
        cpal::SampleFormat::I32 => create_stream::<i32>(params),
        cpal::SampleFormat::I64 => create_stream::<i64>(params),
        cpal::SampleFormat::U8 => create_stream::<u8>(params),
        cpal::SampleFormat::U16 => create_stream::<u16>(params),
        cpal::SampleFormat::U32 => create_stream::<u32>(params),
        cpal::SampleFormat::U64 => create_stream::<u64>(params),
        cpal::SampleFormat::F32 => create_stream::<f32>(params),
        cpal::SampleFormat::F64 => create_stream::<f64>(params),
        f => Err(Error::UnsupportedSampleFormat(f)),
    }
}

fn create_stream<T>(mut params: StreamParams) -> Result<Stream, Error>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = params.cfg.channels as usize;
    let err_fn = |err| error!("An error occurred on stream: {}", err);

    let stream = params
        .device
        .build_output_stream(
            &params.cfg,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut peak = 0.0f32;
                for frame in data.chunks_mut(channels) {
                    let lval = params.lbuf_rx.try_pop().unwrap_or(0.0);
                    let rval = params.rbuf_rx.try_pop().unwrap_or(0.0);
                    peak = peak.max(lval.abs()).max(rval.abs());
                    let values = [T::from_sample(lval), T::from_sample(rval)];

                    for (k, sample) in frame.iter_mut().enumerate() {
                        *sample = values[k & 1];
                    }
                }
                params.master_peak.store(peak);
            },
            err_fn,
            None,
        )
        .map_err(Error::BuildStream)?;
    stream.play().map_err(Error::PlayStream)?;
    Ok(stream)
}

fn create_buffers(capacity: usize) -> ((BufferTx, BufferRx), (BufferTx, BufferRx)) {
    let lbuf = ringbuf::HeapRb::<f32>::new(capacity.max(2));
    let rbuf = ringbuf::HeapRb::<f32>::new(capacity.max(2));
    (lbuf.split(), rbuf.split())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::graph::Format;

    fn drain(rx: &mut BufferRx) {
        while rx.try_pop().is_some() {}
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn paused_render_thread_stays_out_of_the_graph() {
        let params = OutputParams {
            sample_rate: 44100,
            buffer_size: 4,
        };
        let graph = RenderGraph::new(Format::default(), Default::default());
        let taps = Taps {
            master_peak: Default::default(),
            cpu_load: Default::default(),
            transport: Arc::new(Transport::new(params.sample_rate)),
        };
        let ((ltx, mut lrx), (rtx, mut rrx)) = create_buffers(8);
        let (commands, command_rx) = mpsc::channel();
        let render = thread::spawn(move || {
            run_render_loop(graph, params, taps, ltx, rtx, command_rx);
        });

        wait_for(|| lrx.occupied_len() == 8);
        let (ack_tx, ack_rx) = mpsc::channel();
        commands.send(Command::Pause(ack_tx)).unwrap();
        ack_rx.recv().unwrap();

        drain(&mut lrx);
        drain(&mut rrx);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(lrx.occupied_len(), 0);

        commands.send(Command::Resume).unwrap();
        wait_for(|| lrx.occupied_len() > 0);

        commands.send(Command::Stop).unwrap();
        render.join().unwrap();
    }

    #[test]
    fn buffers_hold_two_render_blocks() {
        let ((mut ltx, mut lrx), _) = super::create_buffers(8);
        assert_eq!(ltx.vacant_len(), 8);
        assert_eq!(ltx.push_slice(&[0.5; 4]), 4);
        assert_eq!(ltx.push_slice(&[0.5; 8]), 4);
        assert_eq!(lrx.try_pop(), Some(0.5));
        assert_eq!(lrx.occupied_len(), 7);
    }
}
