use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use vlfclock::configuration::{choose_block_size, HardwareClockConfig, PulseConfig};
use vlfclock::discipline::{ClockState, ControlOutcome, HardwareClockDiscipline};
use vlfclock::pipeline::{HardwareClockPipeline, PulsePipeline};
use vlfclock::sink::{Block, BlockReader, BlockSink, BlockWriter, MemoryBlocks};
use vlfclock::source::{FrameBatch, FrameSource};
use vlfclock::synth::{PpsSource, SimulatedClock, ToneSource};
use vlfclock::Timestamp;

const RATE: u32 = 8000;
const T0: i64 = 1_700_000_000;

/// Rate evaluation every second instead of every ten.
fn accelerated() -> HardwareClockConfig {
    HardwareClockConfig { prerun_secs: 2.0, evaluation_secs: 1.0, ..Default::default() }
}

fn method(text: &str) -> PulseConfig {
    PulseConfig { method: Some(text.parse().unwrap()), ..Default::default() }
}

#[test]
fn test_card_then_untimed_retiming() {
    let true_rate = 8000.4;
    let clock = SimulatedClock::new(Timestamp::from_secs(T0));
    let source = ToneSource::new(clock.clone(), RATE, true_rate, 40.0);
    let block_size = choose_block_size(RATE);
    let discipline =
        HardwareClockDiscipline::new(accelerated(), RATE, block_size, true, clock).unwrap();
    let sink = BlockSink::new(BlockWriter::new(Vec::new()), 1, RATE, block_size);
    let mut card = HardwareClockPipeline::new(source, discipline, sink);
    card.run().unwrap();

    assert_eq!(card.restarts(), 0);
    assert_eq!(card.discipline().state(), ClockState::Run);
    assert!((card.discipline().srcal() * 8000.0 - true_rate).abs() < 0.01);
    let bytes = card.into_sink().into_output().into_inner();

    // pre-run and four stable evaluations take 48 batches of 1000
    let mut reader = BlockReader::new(bytes.as_slice()).unwrap();
    let mut batch = FrameBatch::new(1);
    let mut stamps = Vec::new();
    let mut previous: Option<(Timestamp, usize, f64)> = None;
    while let Some(frames) = reader.read_batch(&mut batch).unwrap() {
        assert!((batch.srcal * 8000.0 - true_rate).abs() < 0.01);
        if let Some((t, n, srcal)) = previous {
            let expected = t.add(n as f64 / (srcal * 8000.0));
            assert!(batch.timestamp.diff(expected).abs() < 1e-6);
        }
        for i in 0..frames {
            stamps.push(batch.timestamp.add(i as f64 / (batch.srcal * 8000.0)));
        }
        previous = Some((batch.timestamp, frames, batch.srcal));
    }
    assert_eq!(stamps.len(), 320_016 - 48_000);

    let mut reader = BlockReader::new(bytes.as_slice()).unwrap();
    let mut retime = PulsePipeline::new(method("none"), 1, RATE).unwrap();
    let mut output = BlockSink::new(MemoryBlocks::new(), 1, RATE, 8000);
    retime.run(&mut reader, &mut output).unwrap();
    let blocks = output.into_output();

    let epoch = Timestamp::from_secs(stamps[0].secs() + 2);
    assert_eq!(blocks[0].timestamp, epoch);
    for (i, block) in blocks.iter().enumerate() {
        assert!(block.timestamp.diff(epoch.add(i as f64)).abs() < 1e-9);
        assert_eq!(block.srcal, 1.0);
    }

    // output runs on the exact nominal grid up to the input held back
    // by the resampler
    let total: usize = blocks.iter().map(|b| b.frames()).sum();
    let end = stamps[stamps.len() - 128];
    let expected = (end.diff(epoch) * 8000.0).ceil();
    assert!((total as f64 - expected).abs() <= 2.0, "{} {}", total, expected);
    assert!(total >= 30 * 8000);
}

#[test]
fn test_pulse_retiming_gives_exact_rate() {
    let true_rate = 8000.4;
    let start = Timestamp::compose(T0, 0.3);
    // 6667 frames is 0.8333 s, so 36 batches are exactly 30 s
    let mut source = PpsSource::new(start, RATE, true_rate, 100.0).with_batch_frames(6667);
    let mut pipeline = PulsePipeline::new(method("ppsbase+,c=0.001"), 2, RATE).unwrap();
    assert_eq!(pipeline.output_channels(), &[1]);
    let mut sink = BlockSink::new(MemoryBlocks::new(), 1, RATE, 8000);

    for _ in 0..72 {
        assert_eq!(pipeline.step(&mut source, &mut sink).unwrap(), ControlOutcome::Continue);
    }
    assert!(pipeline.discipline().is_running());
    assert!((pipeline.discipline().srcal() * 8000.0 - true_rate).abs() < 0.01);

    let before = sink.frames_emitted();
    for _ in 0..36 {
        assert_eq!(pipeline.step(&mut source, &mut sink).unwrap(), ControlOutcome::Continue);
    }
    let emitted = sink.frames_emitted() - before;
    assert!((emitted as i64 - 30 * 8000).abs() <= 1, "{}", emitted);
    assert_eq!(pipeline.restarts(), 0);

    let blocks = sink.into_output();
    assert_eq!(blocks[0].timestamp, Timestamp::from_secs(T0 + 4));
    for pair in blocks.windows(2) {
        let spacing = pair[1].timestamp.diff(pair[0].timestamp);
        assert!((spacing - pair[0].frames() as f64 / 8000.0).abs() < 1e-9);
    }

    // the resampled tone matches the tone at the true time of each output
    // frame
    let settled: Vec<_> = blocks
        .iter()
        .filter(|b| b.timestamp.diff(Timestamp::from_secs(T0 + 62)) >= 0.0 && b.frames() == 8000)
        .collect();
    assert!(settled.len() >= 25);
    for block in &settled {
        for i in 0..block.frames() {
            let error = block.frame(i)[0] - source.tone_at(block.frame_time(i));
            assert!(error.abs() < 0.05, "{} at {}", error, block.frame_time(i));
        }
    }

    let last = settled[settled.len() - 1];
    let mut spectrum: Vec<Complex<f64>> = last.channel(0).map(|v| Complex::new(v, 0.0)).collect();
    FftPlanner::new().plan_fft_forward(spectrum.len()).process(&mut spectrum);
    let peak = (1..4000)
        .max_by(|&a, &b| spectrum[a].norm().total_cmp(&spectrum[b].norm()))
        .unwrap();
    assert_eq!(peak, 100);
}

fn steps(
    pipeline: &mut PulsePipeline,
    source: &mut PpsSource,
    sink: &mut BlockSink<MemoryBlocks>,
    count: usize,
) -> Vec<ControlOutcome> {
    (0..count).map(|_| pipeline.step(source, sink).unwrap()).collect()
}

fn peak_bin(block: &Block) -> usize {
    let mut spectrum: Vec<Complex<f64>> = block.channel(0).map(|v| Complex::new(v, 0.0)).collect();
    FftPlanner::new().plan_fft_forward(spectrum.len()).process(&mut spectrum);
    (1..spectrum.len() / 2)
        .max_by(|&a, &b| spectrum[a].norm().total_cmp(&spectrum[b].norm()))
        .unwrap()
}

#[test]
fn test_negative_edge_timing() {
    let true_rate = 8000.4;
    let start = Timestamp::compose(T0, 0.3);
    let mut source = PpsSource::new(start, RATE, true_rate, 100.0)
        .with_batch_frames(6667)
        .with_pulse(1e-3, 0.2e-3, -0.8);
    let mut pipeline = PulsePipeline::new(method("ppsedge-,noppm"), 2, RATE).unwrap();
    let mut sink = BlockSink::new(MemoryBlocks::new(), 1, RATE, 8000);

    let outcomes = steps(&mut pipeline, &mut source, &mut sink, 72);
    assert!(outcomes.iter().all(|o| *o == ControlOutcome::Continue));
    assert!(pipeline.discipline().is_running());
    // edge positions are whole samples, so the estimate hunts a little
    assert!((pipeline.discipline().srcal() * 8000.0 - true_rate).abs() < 1.0);

    let before = sink.frames_emitted();
    steps(&mut pipeline, &mut source, &mut sink, 36);
    let emitted = sink.frames_emitted() - before;
    assert!((emitted as i64 - 30 * 8000).abs() <= 4, "{}", emitted);
    assert_eq!(pipeline.restarts(), 0);

    let blocks = sink.into_output();
    assert_eq!(blocks[0].timestamp.frac(), 0.0);
    let last = blocks.iter().rev().find(|b| b.frames() == 8000).unwrap();
    assert_eq!(peak_bin(last), 100);
}

#[test]
fn test_pulse_retiming_with_coarse_input_rate() {
    let true_rate = 8000.4;
    let start = Timestamp::compose(T0, 0.3);
    // the input claims 8000.8 Hz, off by as much as the card is off nominal
    let mut source = PpsSource::new(start, RATE, true_rate, 100.0)
        .with_batch_frames(6667)
        .with_reported_srcal(1.0001);
    let mut pipeline = PulsePipeline::new(method("ppsbase+,c=0.001"), 2, RATE).unwrap();
    let mut sink = BlockSink::new(MemoryBlocks::new(), 1, RATE, 8000);

    steps(&mut pipeline, &mut source, &mut sink, 72);
    assert!(pipeline.discipline().is_running());
    assert!((pipeline.discipline().srcal() * 8000.0 - true_rate).abs() < 0.01);

    let before = sink.frames_emitted();
    steps(&mut pipeline, &mut source, &mut sink, 36);
    let emitted = sink.frames_emitted() - before;
    assert!((emitted as i64 - 30 * 8000).abs() <= 1, "{}", emitted);
    assert_eq!(pipeline.restarts(), 0);

    let blocks = sink.into_output();
    let epoch = blocks[0].timestamp;
    assert_eq!(epoch.frac(), 0.0);
    assert!(epoch.secs() >= T0 + 4 && epoch.secs() <= T0 + 8, "{}", epoch);
    for block in blocks.iter().filter(|b| b.timestamp.diff(Timestamp::from_secs(T0 + 62)) >= 0.0) {
        for i in 0..block.frames() {
            let error = block.frame(i)[0] - source.tone_at(block.frame_time(i));
            assert!(error.abs() < 0.05, "{} at {}", error, block.frame_time(i));
        }
    }
}

#[test]
fn test_pulse_phase_step_resets_and_relocks() {
    let true_rate = 8000.4;
    let start = Timestamp::compose(T0, 0.3);
    // from T0 + 30.3 on, pulses arrive 2 ms later
    let mut source = PpsSource::new(start, RATE, true_rate, 131.0)
        .with_batch_frames(6667)
        .with_pulse_step(30.0, 2e-3)
        .with_tone(250.0);
    let mut pipeline = PulsePipeline::new(method("ppsbase+,c=0.001"), 2, RATE).unwrap();
    let mut sink = BlockSink::new(MemoryBlocks::new(), 1, RATE, 8000);

    let mut outcomes = steps(&mut pipeline, &mut source, &mut sink, 120);
    let before = sink.frames_emitted();
    outcomes.extend(steps(&mut pipeline, &mut source, &mut sink, 36));
    let emitted = sink.frames_emitted() - before;

    // the jump is far too big to be corrected, so the timebase is dropped
    // within three pulses of it
    let restart = outcomes.iter().position(|o| *o == ControlOutcome::Restart).unwrap();
    assert!((36..=41).contains(&restart), "{}", restart);
    assert_eq!(pipeline.restarts(), 1);
    assert!(pipeline.discipline().is_running());
    assert!((pipeline.discipline().srcal() * 8000.0 - true_rate).abs() < 0.01);
    assert!((emitted as i64 - 30 * 8000).abs() <= 2, "{}", emitted);

    let blocks = sink.into_output();
    assert_eq!(blocks[0].timestamp, Timestamp::from_secs(T0 + 4));

    // output stops at the reset, the part-filled block goes out short and
    // output resumes on a new whole second epoch
    let gap = blocks
        .windows(2)
        .position(|pair| pair[1].timestamp.diff(pair[0].frame_time(pair[0].frames())).abs() > 1e-6)
        .unwrap();
    let (stopped, resumed) = (&blocks[gap], &blocks[gap + 1]);
    assert!(stopped.frames() < 8000);
    assert!(stopped.timestamp.diff(Timestamp::from_secs(T0 + 30)) > 0.0);
    assert_eq!(resumed.timestamp.frac(), 0.0);
    assert!(resumed.timestamp.diff(stopped.timestamp) > 2.0);
    for pair in blocks[gap + 1..].windows(2) {
        let spacing = pair[1].timestamp.diff(pair[0].timestamp);
        assert!((spacing - pair[0].frames() as f64 / 8000.0).abs() < 1e-9);
    }

    // relocked to the late pulses, so each output frame holds the tone as
    // it was 2 ms after the frame's nominal time
    let settled: Vec<_> = blocks
        .iter()
        .filter(|b| b.timestamp.diff(Timestamp::from_secs(T0 + 100)) >= 0.0 && b.frames() == 8000)
        .collect();
    assert!(settled.len() >= 25);
    for block in &settled {
        for i in 0..block.frames() {
            let error = block.frame(i)[0] - source.tone_at(block.frame_time(i).add(2e-3));
            assert!(error.abs() < 0.1, "{} at {}", error, block.frame_time(i));
        }
    }
    assert_eq!(peak_bin(settled[settled.len() - 1]), 250);
}
