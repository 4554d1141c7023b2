//! GhostCodec CLI
//!
//! Command-line interface for checking vendor runtimes and exercising the
//! session stack against the reference platform.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use ghostcodec::driver::DriverRegistry;
use ghostcodec::reference::{
    synthetic_stream, ReferencePlatform, StreamPacket, AMD_LUID, INTEL_LUID, NVIDIA_LUID,
};
use ghostcodec::session::{CuvidSession, MfxSession};
use ghostcodec::{
    probe, ApiKind, BackendSession, Codec, DecoderConfig, DeviceRequest, EncoderConfig, Luid,
    Preset, QpRange, Resolution, SessionInput, TranscodeConfig, Transcoder, Vendor,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "ghostcodec")]
#[command(about = "Unified hardware video transcoding sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show vendor runtime availability and backend support
    Info,

    /// List available encoder presets
    Presets,

    /// Run encode, decode and probe scenarios on the reference platform
    Selftest {
        /// TOML file with [encoder] and [decoder] tables
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Encode on several independent sessions, one thread each
    Bench {
        /// Number of concurrent sessions
        #[arg(short, long, default_value = "4")]
        sessions: usize,

        /// Frames per session
        #[arg(short, long, default_value = "120")]
        frames: u32,

        /// Encoder preset
        #[arg(short, long, default_value = "720p")]
        preset: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ghostcodec=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Presets => cmd_presets(),
        Commands::Selftest { config } => cmd_selftest(config),
        Commands::Bench {
            sessions,
            frames,
            preset,
        } => cmd_bench(sessions, frames, preset),
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

fn cmd_info() -> anyhow::Result<()> {
    println!("GhostCodec System Information");
    println!("=============================\n");
    println!("Version: {}", ghostcodec::VERSION);
    println!("Native APIs: {:?}\n", ApiKind::native());

    let drivers = DriverRegistry::system();
    for vendor in Vendor::ALL {
        println!("=== {} ===", vendor);
        println!("Libraries: {}", ghostcodec::driver::library_names(vendor).join(", "));
        match drivers.acquire(vendor) {
            Ok(driver) => println!("Runtime: Yes ({} libraries)", driver.library_count()),
            Err(e) => println!("Runtime: No ({})", e),
        }
        let encode = ghostcodec::SessionKind::for_vendor(vendor, true);
        let decode = ghostcodec::SessionKind::for_vendor(vendor, false);
        println!("Encode backend: {}", encode.map(|k| k.to_string()).unwrap_or_else(|| "none".into()));
        println!("Decode backend: {}", decode.map(|k| k.to_string()).unwrap_or_else(|| "none".into()));
        println!();
    }

    Ok(())
}

fn cmd_presets() -> anyhow::Result<()> {
    println!("Available Presets");
    println!("=================\n");

    let names = ["720p", "1080p", "lowlatency", "quality", "4k"];
    for (name, preset) in names.iter().zip(Preset::ALL) {
        println!("  {:<12} ({:?}) - {}", name, preset, preset.description());
    }

    println!("\nUsage: ghostcodec bench --preset <name>");

    Ok(())
}

fn cmd_selftest(path: Option<PathBuf>) -> anyhow::Result<()> {
    println!("GhostCodec Self-Test (reference platform)");
    println!("=========================================\n");

    let config = match path {
        Some(path) => TranscodeConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TranscodeConfig {
            encoder: EncoderConfig::from_preset(Preset::Stream1080p60)
                .with_gop(60)
                .with_qp(QpRange::new(10, 40)?),
            decoder: DecoderConfig::default(),
        },
    };

    let platform = Arc::new(ReferencePlatform::new());
    let mut failures = 0;

    // Encode
    let amd = Transcoder::shared(platform.clone(), Vendor::Amd);
    let encoder = &config.encoder;
    let request = DeviceRequest::new(AMD_LUID, encoder.api);
    match amd.create_encoder(request, encoder) {
        Some(mut session) => {
            let texture = platform.caller_texture(encoder.resolution, [32, 64, 96, 255]);
            let mut bytes = 0;
            let status = session.encode(texture, |data, _| bytes = data.len());
            let ok = status == 0 && bytes > 0;
            println!(
                "[{}] encode {} {}: status {}, {} bytes",
                if ok { "PASS" } else { "FAIL" },
                encoder.codec,
                encoder.resolution,
                status,
                bytes
            );
            failures += usize::from(!ok);
            session.destroy();
            platform.store().remove(texture);
        }
        None => {
            println!("[FAIL] encode session could not be created");
            failures += 1;
        }
    }

    // Decode with a mid-stream resolution change
    let decoder = config.decoder.clone().with_codec(Codec::H264);
    let mut stream = synthetic_stream(Codec::H264, Resolution::HD_720P, 3);
    stream.extend(synthetic_stream(Codec::H264, Resolution::FHD_1080P, 3));

    let request = DeviceRequest::new(NVIDIA_LUID, decoder.api);
    let mut cuvid = CuvidSession::create(platform.as_ref(), request, &decoder)?;
    let frames = decode_all(&mut cuvid, &stream)?;
    let ok = frames == stream.len() && cuvid.recreations() == 1;
    println!(
        "[{}] cuvid decode 720p -> 1080p: {} frames, {} recreation(s)",
        if ok { "PASS" } else { "FAIL" },
        frames,
        cuvid.recreations()
    );
    failures += usize::from(!ok);
    cuvid.destroy();

    let request = DeviceRequest::new(INTEL_LUID, decoder.api);
    let mut mfx = MfxSession::create(platform.as_ref(), request, &decoder)?;
    let frames = decode_all(&mut mfx, &stream)?;
    let ok = frames == stream.len() && mfx.reinits() == 1;
    println!(
        "[{}] mfx decode 720p -> 1080p: {} frames, {} reinit(s)",
        if ok { "PASS" } else { "FAIL" },
        frames,
        mfx.reinits()
    );
    failures += usize::from(!ok);
    mfx.destroy();

    // Capability probe
    let sample = StreamPacket::new(Codec::H264, Resolution::HD_720P).to_bytes();
    for vendor in Vendor::ALL {
        let encode = probe::test_encode(platform.as_ref(), vendor, encoder, 4)?;
        let decode = probe::test_decode(platform.as_ref(), vendor, &decoder, &sample, 4)?;
        println!(
            "[INFO] {} capable adapters: encode {:?}, decode {:?}",
            vendor,
            encode.iter().map(|d| d.luid.to_string()).collect::<Vec<_>>(),
            decode.iter().map(|d| d.luid.to_string()).collect::<Vec<_>>()
        );
    }

    let leaked = platform.store().live_objects();
    println!(
        "[{}] objects alive after teardown: {}",
        if leaked == 0 { "PASS" } else { "FAIL" },
        leaked
    );
    failures += usize::from(leaked != 0);

    println!();
    if failures > 0 {
        bail!("{} self-test check(s) failed", failures);
    }
    println!("All checks passed.");
    Ok(())
}

fn decode_all(session: &mut dyn BackendSession, stream: &[Vec<u8>]) -> ghostcodec::Result<usize> {
    let mut frames = 0;
    for packet in stream {
        session.submit(SessionInput::Bitstream(packet))?;
        while session.drain_output()?.is_some() {
            frames += 1;
        }
    }
    Ok(frames)
}

struct BenchResult {
    session: usize,
    luid: Luid,
    frames: u32,
    bytes: usize,
    elapsed: Duration,
    failed: Option<i32>,
}

fn cmd_bench(sessions: usize, frames: u32, preset: String) -> anyhow::Result<()> {
    println!("GhostCodec Session Benchmark");
    println!("============================\n");

    let Some(preset) = Preset::from_name(&preset) else {
        bail!("Unknown preset: {}. Use 'ghostcodec presets' to see available.", preset);
    };
    if sessions == 0 {
        bail!("at least one session is required");
    }
    let config = EncoderConfig::from_preset(preset);

    // One adapter per session so no two sessions share a device
    let luids: Vec<Luid> = (0..sessions).map(|i| Luid(AMD_LUID.0 + i as i64)).collect();
    let platform = luids[1..]
        .iter()
        .fold(ReferencePlatform::new(), |p, luid| p.with_adapter(*luid, Vendor::Amd));
    let amd = Transcoder::new(platform, Vendor::Amd);

    println!("Preset: {:?} ({})", preset, preset.description());
    println!("Sessions: {}", sessions);
    println!("Frames per session: {}", frames);
    println!();
    println!("Running benchmark...\n");

    let (tx, rx) = unbounded();
    let start = Instant::now();
    let mut workers = Vec::with_capacity(sessions);
    for (index, luid) in luids.into_iter().enumerate() {
        let amd = amd.clone();
        let config = config.clone();
        let tx = tx.clone();
        workers.push(std::thread::spawn(move || {
            let mut result = BenchResult {
                session: index,
                luid,
                frames: 0,
                bytes: 0,
                elapsed: Duration::ZERO,
                failed: None,
            };
            let Some(mut session) = amd.create_encoder(DeviceRequest::new(luid, config.api), &config) else {
                result.failed = Some(ghostcodec::Error::BackendInit(String::new()).status());
                let _ = tx.send(result);
                return;
            };
            let texture = amd.platform().caller_texture(config.resolution, [16, 128, 240, 255]);
            let started = Instant::now();
            for _ in 0..frames {
                let status = session.encode(texture, |data, _| result.bytes += data.len());
                if status < 0 {
                    result.failed = Some(status);
                    break;
                }
                result.frames += 1;
            }
            result.elapsed = started.elapsed();
            session.destroy();
            let _ = tx.send(result);
        }));
    }
    drop(tx);

    let mut results: Vec<BenchResult> = rx.iter().collect();
    for worker in workers {
        if worker.join().is_err() {
            bail!("benchmark worker panicked");
        }
    }
    let elapsed = start.elapsed();
    results.sort_by_key(|r| r.session);

    println!("Results:");
    let mut total_frames = 0u64;
    for r in &results {
        let fps = r.frames as f64 / r.elapsed.as_secs_f64().max(f64::EPSILON);
        match r.failed {
            Some(status) => println!(
                "  #{} on {}: failed with status {} after {} frames",
                r.session, r.luid, status, r.frames
            ),
            None => println!(
                "  #{} on {}: {} frames, {} bytes, {:.1} fps",
                r.session, r.luid, r.frames, r.bytes, fps
            ),
        }
        total_frames += r.frames as u64;
    }
    let aggregate = total_frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!("\n  Total time: {:.2}s", elapsed.as_secs_f64());
    println!("  Aggregate FPS: {:.1}", aggregate);
    println!(
        "  Realtime capable ({} x {} fps): {}",
        sessions,
        config.framerate,
        yes_no(aggregate >= (sessions as u32 * config.framerate) as f64)
    );

    Ok(())
}
