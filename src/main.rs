use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vlfclock::configuration::{CardArgs, Cli, Command, Config, Parser, TimeArgs};
use vlfclock::discipline::HardwareClockDiscipline;
use vlfclock::pipeline::{HardwareClockPipeline, PulsePipeline};
use vlfclock::sink::{BlockReader, BlockSink, BlockWriter};
use vlfclock::source::{FrameSource, RawFrameSource, SampleFormat, SystemClock};
use vlfclock::Sample;

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // stdout carries the data stream
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn open_input(name: &str) -> anyhow::Result<Box<dyn Read>> {
    if name == "-" {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(name).with_context(|| format!("cannot open input {}", name))?;
    Ok(Box::new(BufReader::new(file)))
}

fn open_output(name: &str) -> anyhow::Result<Box<dyn Write>> {
    if name == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout().lock())));
    }
    let file = File::create(name).with_context(|| format!("cannot create output {}", name))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn run_card(args: &CardArgs, config: Config) -> anyhow::Result<()> {
    let format = SampleFormat::from_bits(args.bits, args.packed24)?;
    let source = RawFrameSource::new(open_input("-")?, format, args.channels, args.rate)?
        .with_gain(args.gain as Sample)
        .with_live(args.live)
        .with_frames_per_read(args.read_frames);
    let block_size = config.stream.block_size_for(args.rate)?;
    info!(rate = args.rate, channels = args.channels, bits = args.bits, block_size, "card");

    let discipline = HardwareClockDiscipline::new(
        config.hardware_clock,
        args.rate,
        block_size,
        source.is_live(),
        SystemClock,
    )?;
    let sink = BlockSink::new(
        BlockWriter::new(open_output(&args.output)?),
        args.channels,
        args.rate,
        block_size,
    );
    HardwareClockPipeline::new(source, discipline, sink).run()?;
    Ok(())
}

fn run_time(args: &TimeArgs, config: Config) -> anyhow::Result<()> {
    let mut source = BlockReader::new(open_input(&args.input)?)
        .context("cannot read input stream header")?;
    let (channels, rate) = (source.channels(), source.sample_rate());
    let block_size = config.stream.block_size_for(rate)?;

    let mut pipeline = PulsePipeline::new(config.pulse, channels, rate)?;
    info!(rate, channels, output_channels = ?pipeline.output_channels(), block_size, "time");
    let mut sink = BlockSink::new(
        BlockWriter::new(open_output(&args.output)?),
        pipeline.output_channels().len(),
        rate,
        block_size,
    );
    pipeline.run(&mut source, &mut sink)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.resolve_config()?;
    match &cli.command {
        Command::Card(args) => run_card(args, config),
        Command::Time(args) => run_time(args, config),
    }
}
