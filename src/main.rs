use std::collections::VecDeque;

use anyhow::{Context, Result};
use clap::Parser;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FrameCount, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use rubato::Resampler;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::fmt::time::ChronoLocal;

use converse::types::audio::CONVERSE_SAMPLE_RATE_HERTZ;
use converse::utils;
use converse::{client, Coordinator, TurnOutcome};

/// Samples per chunk read from the capture device.
const CAPTURE_CHUNK_SIZE: usize = 1024;
/// Samples per chunk requested by the playback device.
const PLAYBACK_CHUNK_SIZE: usize = 1024;
/// How much decoded audio the playback buffer can hold.
const OUTPUT_LATENCY_MS: usize = 1000;

#[derive(Parser)]
#[command(name = "converse", about = "Talk to the assistant from your terminal")]
struct Cli {
    /// Verbose progress markers, including one per captured frame
    #[arg(long)]
    debug: bool,

    /// Capture device name, default input when omitted
    #[arg(long)]
    input_device: Option<String>,

    /// Playback device name, default output when omitted
    #[arg(long)]
    output_device: Option<String>,

    /// Print the available audio devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.debug { Level::TRACE } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    if cli.list_devices {
        match list_devices() {
            Ok(listing) => {
                println!("{}", listing);
                return;
            }
            Err(e) => {
                tracing::error!("failed to list audio devices: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    let mut coordinator = Coordinator::new();
    loop {
        match run_turn_once(&cli, &mut coordinator).await {
            Ok(TurnOutcome::Quit) => {
                std::process::exit(0);
            }
            Ok(TurnOutcome::Continue) => {
                if !ask_the_user().await {
                    std::process::exit(0);
                }
            }
            Err(e) => {
                tracing::error!("turn failed: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn list_devices() -> Result<String> {
    let inputs = utils::device::list_inputs()?;
    let outputs = utils::device::list_outputs()?;
    Ok(format!("inputs:\n{}\noutputs:\n{}", inputs, outputs))
}

/// Blocking prompt between turns. Returns false when the user wants out.
async fn ask_the_user() -> bool {
    println!("Press enter when ready to speak (q to quit)");
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    match stdin.read_line(&mut line).await {
        Ok(0) | Err(_) => false,
        Ok(_) => !matches!(line.trim(), "q" | "quit" | "exit"),
    }
}

/// Open the devices and the session, then hand control to the coordinator
/// for one turn. Devices are opened per turn and dropped on the way out.
async fn run_turn_once(cli: &Cli, coordinator: &mut Coordinator) -> Result<TurnOutcome> {
    let session = client::connect(client::Config::new())
        .await
        .context("failed to acquire connection")?;

    // Capture side: device -> mono chunks -> 16kHz frames.
    let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<f32>>(1024);

    let input = utils::device::get_or_default_input(cli.input_device.clone())
        .context("failed to get the capture device")?;
    tracing::info!("using input device: {:?}", input.name()?);

    let input_config = input
        .default_input_config()
        .context("failed to get default input config")?;
    let input_config = StreamConfig {
        channels: input_config.channels(),
        sample_rate: input_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(CAPTURE_CHUNK_SIZE as u32)),
    };
    let input_channel_count = input_config.channels as usize;
    let input_sample_rate = input_config.sample_rate.0;
    tracing::debug!("input stream config: {:?}", &input_config);

    let input_data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        let audio = if input_channel_count > 1 {
            data.chunks(input_channel_count)
                .map(|c| c.iter().sum::<f32>() / input_channel_count as f32)
                .collect::<Vec<f32>>()
        } else {
            data.to_vec()
        };
        if let Err(e) = raw_tx.try_send(audio) {
            tracing::warn!("capture buffer full, dropping a chunk: {:?}", e);
        }
    };
    let input_stream = input
        .build_input_stream(
            &input_config,
            input_data_fn,
            move |err| tracing::error!("capture stream error: {}", err),
            None,
        )
        .context("failed to build the capture stream")?;
    input_stream
        .play()
        .context("failed to start the capture stream")?;

    let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(64);
    let mut in_resampler = utils::audio::create_resampler(
        input_sample_rate as f64,
        CONVERSE_SAMPLE_RATE_HERTZ as f64,
        CAPTURE_CHUNK_SIZE,
    )
    .context("failed to create the capture resampler")?;
    let capture_pipeline = tokio::spawn(async move {
        let mut buffer: VecDeque<f32> = VecDeque::with_capacity(CAPTURE_CHUNK_SIZE * 2);
        while let Some(audio) = raw_rx.recv().await {
            buffer.extend(audio);
            while buffer.len() >= CAPTURE_CHUNK_SIZE {
                let chunk: Vec<f32> = buffer.drain(..CAPTURE_CHUNK_SIZE).collect();
                let Ok(resampled) = in_resampler.process(&[chunk.as_slice()], None) else {
                    tracing::warn!("capture resampling failed, dropping a chunk");
                    continue;
                };
                if let Some(resampled) = resampled.first() {
                    if frame_tx.send(resampled.clone()).await.is_err() {
                        // the turn is over
                        return;
                    }
                }
            }
        }
    });

    // Playback side: 16kHz frames -> device rate -> ring buffer -> device.
    let output = utils::device::get_or_default_output(cli.output_device.clone())
        .context("failed to get the playback device")?;
    tracing::info!("using output device: {:?}", output.name()?);

    let output_config = output
        .default_output_config()
        .context("failed to get default output config")?;
    let output_config = StreamConfig {
        channels: output_config.channels(),
        sample_rate: output_config.sample_rate(),
        buffer_size: cpal::BufferSize::Fixed(FrameCount::from(PLAYBACK_CHUNK_SIZE as u32)),
    };
    let output_channel_count = output_config.channels as usize;
    let output_sample_rate = output_config.sample_rate.0;
    tracing::debug!("output stream config: {:?}", &output_config);

    let shared = utils::audio::shared_buffer(
        output_sample_rate as usize * OUTPUT_LATENCY_MS / 1000,
    );
    let (mut audio_out_tx, mut audio_out_rx) = shared.split();

    let output_data_fn = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
        let mut sample_index = 0;
        while sample_index < data.len() {
            let sample = audio_out_rx.try_pop().unwrap_or(0.0);
            for _ in 0..output_channel_count.min(2) {
                if sample_index < data.len() {
                    data[sample_index] = sample;
                    sample_index += 1;
                }
            }
            // leave any remaining channels silent
            sample_index += output_channel_count.saturating_sub(2);
        }
    };
    let output_stream = output
        .build_output_stream(
            &output_config,
            output_data_fn,
            move |err| tracing::error!("playback stream error: {}", err),
            None,
        )
        .context("failed to build the playback stream")?;
    output_stream
        .play()
        .context("failed to start the playback stream")?;

    let (playback_tx, mut playback_rx) = mpsc::channel::<Vec<f32>>(64);
    let mut out_resampler = utils::audio::create_resampler(
        CONVERSE_SAMPLE_RATE_HERTZ as f64,
        output_sample_rate as f64,
        100,
    )
    .context("failed to create the playback resampler")?;
    let playback_pipeline = tokio::spawn(async move {
        while let Some(frame) = playback_rx.recv().await {
            let chunk_size = out_resampler.input_frames_next();
            for chunk in utils::audio::split_for_chunks(&frame, chunk_size) {
                let Ok(resampled) = out_resampler.process(&[chunk.as_slice()], None) else {
                    tracing::warn!("playback resampling failed, dropping a chunk");
                    continue;
                };
                if let Some(resampled) = resampled.first() {
                    for sample in resampled {
                        if audio_out_tx.try_push(*sample).is_err() {
                            tracing::warn!("playback buffer full, dropping samples");
                            break;
                        }
                    }
                }
            }
        }
    });

    let outcome = coordinator
        .run_turn(
            session.requests(),
            session.responses(),
            frame_rx,
            playback_tx,
        )
        .await;

    session.shutdown().await;
    drop(input_stream);
    drop(output_stream);
    let _ = capture_pipeline.await;
    let _ = playback_pipeline.await;

    Ok(outcome?)
}
