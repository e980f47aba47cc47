use crate::{
    cannon::{format_step_file, HostProgram, PreimageStop, Start, StepFrequency, VmConfiguration},
    error::VmError,
    metadata::Meta,
    mips::InstrumentedState,
    preimage_oracle::{NullPreImageOracle, PreImageOracle, PreImageOracleT},
    state::State,
    witness::StepProof,
};
use clap::{arg, Parser};
use log::{error, info};
use serde::Serialize;
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    process::ExitCode,
};
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, value_name = "FILE", default_value = "state.json", help = "initial state file")]
    pub input: String,

    #[arg(long, value_name = "FILE", default_value = "out.json", help = "output state file")]
    pub output: String,

    #[arg(long, value_name = "FILE", help = "metadata file")]
    pub meta: Option<String>,

    #[arg(long = "proof-at", value_name = "FREQ", default_value = "never")]
    pub proof_at: StepFrequency,

    #[arg(long = "proof-fmt", value_name = "FORMAT", default_value = "proof-%d.json")]
    pub proof_fmt: String,

    #[arg(long = "snapshot-at", value_name = "FREQ", default_value = "never")]
    pub snapshot_at: StepFrequency,

    #[arg(long = "snapshot-fmt", value_name = "FORMAT", default_value = "state-%d.json")]
    pub snapshot_fmt: String,

    #[arg(long = "stop-at", value_name = "FREQ", default_value = "never")]
    pub stop_at: StepFrequency,

    #[arg(long = "info-at", value_name = "FREQ", default_value = "never")]
    pub info_at: StepFrequency,

    #[arg(
        long = "stop-at-preimage",
        value_name = "KEY[@OFFSET]",
        value_parser = PreimageStop::parse_key,
        help = "stop after the first read of a pre-image whose key starts with KEY, at OFFSET"
    )]
    pub stop_at_preimage: Option<PreimageStop>,

    #[arg(
        long = "stop-at-preimage-type",
        value_name = "TYPE",
        value_parser = PreimageStop::parse_type,
        help = "stop after the first read of a pre-image of this type: local, keccak, sha256, blob, precompile or any"
    )]
    pub stop_at_preimage_type: Option<PreimageStop>,

    #[arg(
        long = "stop-at-preimage-larger-than",
        value_name = "SIZE",
        help = "stop after the first read of a pre-image larger than SIZE bytes"
    )]
    pub stop_at_preimage_larger_than: Option<usize>,

    #[arg(
        last = true,
        value_name = "HOST",
        help = "host program command line: <host program> [host program arguments]"
    )]
    pub host: Vec<String>,
}

impl From<RunArgs> for VmConfiguration {
    fn from(args: RunArgs) -> Self {
        let host = args.host.split_first().map(|(name, arguments)| HostProgram {
            name: name.clone(),
            arguments: arguments.to_vec(),
        });
        VmConfiguration {
            input_state_file: args.input,
            output_state_file: args.output,
            metadata_file: args.meta,
            proof_at: args.proof_at,
            stop_at: args.stop_at,
            snapshot_state_at: args.snapshot_at,
            info_at: args.info_at,
            // An explicit key takes precedence over a key type
            stop_at_preimage: args
                .stop_at_preimage
                .or(args.stop_at_preimage_type)
                .unwrap_or_default(),
            stop_at_preimage_larger_than: args.stop_at_preimage_larger_than.filter(|size| *size > 0),
            proof_fmt: args.proof_fmt,
            snapshot_fmt: args.snapshot_fmt,
            host,
        }
    }
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("{path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("could not start the pre-image server: {0}")]
    Host(std::io::Error),
    #[error("step {step} failed: {source}")]
    Vm { step: u64, source: VmError },
}

pub fn read_state(path: &str) -> Result<State, RunError> {
    let file = File::open(path).map_err(|source| RunError::File {
        path: path.to_string(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| RunError::Json {
        path: path.to_string(),
        source,
    })
}

pub fn write_json<T: Serialize>(path: &str, value: &T) -> Result<(), RunError> {
    let file = File::create(path).map_err(|source| RunError::File {
        path: path.to_string(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value).map_err(|source| RunError::Json {
        path: path.to_string(),
        source,
    })?;
    writer.flush().map_err(|source| RunError::File {
        path: path.to_string(),
        source,
    })
}

fn pp_info<O: PreImageOracleT, W1: Write, W2: Write>(
    vm: &InstrumentedState<O, W1, W2>,
    meta: Option<&Meta>,
    start: &Start,
) {
    let elapsed = start.time.elapsed();
    let step = vm.state.step;
    let pc = vm.state.pc;
    let insn = vm.state.memory.get_memory(pc & !3).unwrap_or_default();
    let how_many_steps = step - start.step;
    let ips = how_many_steps as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    let name = meta
        .and_then(|meta| meta.find_address_symbol(pc))
        .unwrap_or_else(|| "n/a".to_string());

    info!(
        "processing step={} pc={:#010x} insn={:#010x} ips={:.2} pages={} mem={} name={}",
        step,
        pc,
        insn,
        ips,
        vm.state.memory.page_count(),
        vm.state.memory.usage(),
        name
    );
}

/// Step `vm` until it exits, `config.stop_at` matches or a pre-image read
/// matches one of the `stop_at_preimage` settings, writing proofs and
/// snapshots on the way.
pub fn run_vm<O: PreImageOracleT, W1: Write, W2: Write>(
    config: &VmConfiguration,
    vm: &mut InstrumentedState<O, W1, W2>,
    meta: Option<&Meta>,
) -> Result<(), RunError> {
    let start = Start::create(vm.state.step);

    while !vm.state.exited {
        let step = vm.state.step;

        if config.info_at.matches(step) {
            pp_info(vm, meta, &start);
        }

        if config.stop_at.matches(step) {
            info!("Stopping at step {step}");
            break;
        }

        if config.snapshot_state_at.matches(step) {
            write_json(&format_step_file(&config.snapshot_fmt, step), &vm.state)?;
        }

        let with_proof = config.proof_at.matches(step);
        let witness = vm
            .step(with_proof)
            .map_err(|source| RunError::Vm { step, source })?;
        if let Some(witness) = witness {
            let post = vm.state.state_hash();
            let proof = StepProof::create(step, &witness, post);
            write_json(&format_step_file(&config.proof_fmt, step), &proof)?;
        }

        if let Some(last) = vm.last_preimage() {
            if config.stop_at_preimage.matches(&last.key, last.offset) {
                info!(
                    "Stopping at pre-image read of key 0x{} at offset {}",
                    hex::encode(last.key),
                    last.offset
                );
                break;
            }
            if config
                .stop_at_preimage_larger_than
                .is_some_and(|size| last.size > size)
            {
                info!("Stopping at pre-image read of {} bytes", last.size);
                break;
            }
        }
    }

    if vm.state.exited {
        info!(
            "Program exited with code {} after {} steps",
            vm.state.exit_code, vm.state.step
        );
    }
    Ok(())
}

pub fn run(config: &VmConfiguration) -> Result<State, RunError> {
    let state = read_state(&config.input_state_file)?;

    let meta = match &config.metadata_file {
        Some(path) => Some(Meta::from_file(path).map_err(|source| RunError::File {
            path: path.clone(),
            source,
        })?),
        None => None,
    };

    let mut child = None;
    let oracle: Box<dyn PreImageOracleT> = match &config.host {
        Some(host) => {
            let mut po = PreImageOracle::create(host).map_err(RunError::Host)?;
            child = Some(po.start().map_err(RunError::Host)?);
            Box::new(po)
        }
        None => Box::new(NullPreImageOracle),
    };

    let mut vm = InstrumentedState::new(state, oracle, std::io::stdout(), std::io::stderr());
    let res = run_vm(config, &mut vm, meta.as_ref());

    if let Some(child) = child.as_mut() {
        // The server does not exit on its own
        let _ = child.kill();
        let _ = child.wait();
    }
    res?;

    write_json(&config.output_state_file, &vm.state)?;
    Ok(vm.state)
}

pub fn main(args: RunArgs) -> ExitCode {
    let configuration: VmConfiguration = args.into();
    match run(&configuration) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
