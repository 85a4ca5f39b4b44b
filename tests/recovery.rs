use std::f64::consts::PI;

use vlfclock::configuration::HardwareClockConfig;
use vlfclock::discipline::{ClockState, ControlOutcome, HardwareClockDiscipline};
use vlfclock::pipeline::HardwareClockPipeline;
use vlfclock::sink::{BlockSink, MemoryBlocks};
use vlfclock::synth::{SimulatedClock, ToneSource};
use vlfclock::{Sample, Timestamp};

const RATE: u32 = 8000;

fn accelerated() -> HardwareClockConfig {
    HardwareClockConfig { prerun_secs: 2.0, evaluation_secs: 1.0, ..Default::default() }
}

type Card = HardwareClockPipeline<ToneSource, SimulatedClock, BlockSink<MemoryBlocks>>;

fn pipeline(source: ToneSource, clock: SimulatedClock) -> Card {
    let discipline = HardwareClockDiscipline::new(accelerated(), RATE, 2048, true, clock).unwrap();
    let sink = BlockSink::new(MemoryBlocks::new(), 1, RATE, 2048);
    HardwareClockPipeline::new(source, discipline, sink)
}

fn run(pipeline: &mut Card) -> Vec<ControlOutcome> {
    let mut outcomes = Vec::new();
    loop {
        match pipeline.step().unwrap() {
            ControlOutcome::Drained => return outcomes,
            outcome => outcomes.push(outcome),
        }
    }
}

#[test]
fn test_converges_and_holds() {
    let true_rate = 8004.0;
    let clock = SimulatedClock::new(Timestamp::from_secs(1_700_000_000));
    let source = ToneSource::new(clock.clone(), RATE, true_rate, 120.0).with_batch_frames(800);
    let mut pipeline = pipeline(source, clock);
    let outcomes = run(&mut pipeline);
    assert!(outcomes.iter().all(|o| *o == ControlOutcome::Continue));
    assert_eq!(pipeline.discipline().state(), ClockState::Run);
    assert!((pipeline.discipline().srcal() * 8000.0 - true_rate).abs() < 0.01);
    assert!(pipeline.discipline().slew().abs() <= 0.25 / 8000.0);
}

#[test]
fn test_stalled_read_restarts_calibration() {
    let true_rate = 8004.0;
    let clock = SimulatedClock::new(Timestamp::from_secs(1_700_000_000));
    // the 31st read takes 3 s longer than its 1000 frames
    let source = ToneSource::new(clock.clone(), RATE, true_rate, 20.0).with_stall(30, 3.0);
    let mut pipeline = pipeline(source, clock);
    let outcomes = run(&mut pipeline);

    // noticed at the next evaluation, the second of setup
    assert_eq!(outcomes.iter().position(|o| *o == ControlOutcome::Restart), Some(32));
    assert_eq!(pipeline.restarts(), 1);

    // calibrated again from scratch and running by the end
    assert_eq!(pipeline.discipline().state(), ClockState::Run);
    assert!((pipeline.discipline().srcal() * 8000.0 - true_rate).abs() < 0.01);
    // running from the 82nd batch of 1000 to the 80 frame tail
    assert_eq!(pipeline.sink().frames_emitted(), 79 * 1000 + 80);
}

/// Cycles per second of a tone that stays within a quarter cycle over the
/// runs here, so its value identifies the frame.
const SLOW_TONE: f64 = 0.005;

fn frame_index(value: Sample, true_rate: f64) -> u64 {
    (value.asin() / (2.0 * PI * SLOW_TONE) * true_rate).round() as u64
}

#[test]
fn test_restart_while_running_keeps_stamps_true() {
    let true_rate = 8004.0;
    let t0 = Timestamp::from_secs(1_700_000_000);
    let clock = SimulatedClock::new(t0);
    // running from the 49th read, and the 71st takes 3 s longer than its
    // 1000 frames
    let source = ToneSource::new(clock.clone(), RATE, true_rate, 25.0)
        .with_frequency(SLOW_TONE)
        .with_stall(70, 3.0);
    let mut pipeline = pipeline(source, clock);
    let outcomes = run(&mut pipeline);
    assert_eq!(outcomes.iter().filter(|o| **o == ControlOutcome::Restart).count(), 1);
    assert_eq!(pipeline.discipline().state(), ClockState::Run);
    assert_eq!(pipeline.source().reads(), 201);
    let blocks = pipeline.into_sink().into_output();

    // Each frame is stamped with the clock reading when its read returned,
    // which is 1000 frames after the first frame of the read. Frames from
    // after the restart carry the stall as well.
    let mut shift = 0.0;
    let mut previous: Option<u64> = None;
    let mut short_blocks = 0;
    for (b, block) in blocks.iter().enumerate() {
        if block.frames() < 2048 && b + 1 < blocks.len() {
            short_blocks += 1;
        }
        for i in 0..block.frames() {
            let k = frame_index(block.frame(i)[0], true_rate);
            if let Some(p) = previous {
                if k != p + 1 {
                    assert_eq!(shift, 0.0, "second gap at frame {}", k);
                    shift = 3.0;
                }
            }
            previous = Some(k);
            let expected = t0.add((k + 1000) as f64 / true_rate + shift);
            let error = block.frame_time(i).diff(expected);
            assert!(error.abs() < 0.05, "frame {} stamped {} s off", k, error);
        }
    }
    assert_eq!(shift, 3.0);
    assert_eq!(short_blocks, 1);
}
