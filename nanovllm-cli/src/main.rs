use std::io::Write;
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::error;
use nanovllm_engine::{EngineOptions, LlmEngine, SamplingParams};

fn cli() -> Command {
    Command::new("nanovllm")
        .about("CPU inference for Qwen-family models with vLLM-style scheduling")
        .arg(
            Arg::new("model")
                .help("Model directory (config.json, tokenizer.json, *.safetensors)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("prompt")
                .help("Prompt text")
                .index(2)
                .default_value("Hello, how are you?"),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Maximum new tokens to generate")
                .default_value("64")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Sampling temperature in [0, inf), 0 = greedy")
                .default_value("0.7")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("top-p")
                .short('p')
                .long("top-p")
                .value_name("FLOAT")
                .help("Nucleus sampling mass in (0, 1]")
                .default_value("0.95")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("top-k")
                .short('k')
                .long("top-k")
                .value_name("INT")
                .help("Top-k cutoff, 0 disables")
                .default_value("50")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("repetition-penalty")
                .long("repetition-penalty")
                .value_name("FLOAT")
                .help("Repetition penalty, 1.0 disables")
                .default_value("1.1")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("presence-penalty")
                .long("presence-penalty")
                .value_name("FLOAT")
                .help("Presence penalty for already-seen tokens")
                .default_value("0.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("frequency-penalty")
                .long("frequency-penalty")
                .value_name("FLOAT")
                .help("Frequency penalty per prior occurrence")
                .default_value("0.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("ignore-eos")
                .long("ignore-eos")
                .help("Keep generating past the eos token")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed for reproducible sampling")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window cap (max_model_len)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("block-size")
                .long("block-size")
                .value_name("INT")
                .help("KV cache block capacity in tokens")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("stream")
                .long("stream")
                .help("Print tokens as they are generated")
                .action(ArgAction::SetTrue),
        )
}

fn sampling_params(matches: &ArgMatches) -> SamplingParams {
    SamplingParams {
        temperature: *matches.get_one::<f32>("temperature").expect("has default"),
        max_tokens: *matches.get_one::<usize>("max-tokens").expect("has default"),
        ignore_eos: matches.get_flag("ignore-eos"),
        top_p: *matches.get_one::<f32>("top-p").expect("has default"),
        top_k: *matches.get_one::<usize>("top-k").expect("has default"),
        repetition_penalty: *matches.get_one::<f32>("repetition-penalty").expect("has default"),
        presence_penalty: *matches.get_one::<f32>("presence-penalty").expect("has default"),
        frequency_penalty: *matches.get_one::<f32>("frequency-penalty").expect("has default"),
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let model_dir = matches.get_one::<String>("model").expect("required");
    let prompt = matches.get_one::<String>("prompt").expect("has default").clone();

    let model_path = Path::new(model_dir);
    if !model_path.exists() {
        anyhow::bail!("model directory does not exist: {model_dir}");
    }

    let options = EngineOptions::builder()
        .max_model_len(matches.get_one::<usize>("context").copied())
        .kvcache_block_size(matches.get_one::<usize>("block-size").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .build()?;

    let mut engine =
        LlmEngine::new(model_path, options).with_context(|| format!("failed to load model from {model_dir}"))?;
    let params = sampling_params(matches);

    println!("Prompt: {prompt}");
    print!("Output: ");

    if matches.get_flag("stream") {
        stream_generation(&mut engine, &prompt, params)
    } else {
        batch_generation(&mut engine, &prompt, params)
    }
}

fn batch_generation(engine: &mut LlmEngine, prompt: &str, params: SamplingParams) -> Result<()> {
    let started = Instant::now();
    let outputs = engine.generate(&[prompt.to_string()], &[params])?;
    let output = &outputs[0];

    println!("{}", output.text);
    report_throughput(output.token_ids.len(), started);
    Ok(())
}

fn stream_generation(engine: &mut LlmEngine, prompt: &str, params: SamplingParams) -> Result<()> {
    engine.add_request(prompt, params)?;
    let started = Instant::now();
    let mut generated = 0usize;

    while !engine.is_finished() {
        let (steps, _done) = engine.step_streaming()?;
        for step in steps {
            // Per-token decode keeps output incremental; multi-byte
            // characters may render once their final token arrives.
            print!("{}", engine.tokenizer().decode(&[step.token_id]));
            std::io::stdout().flush()?;
            generated += 1;
        }
    }

    println!();
    report_throughput(generated, started);
    Ok(())
}

fn report_throughput(tokens: usize, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    if tokens > 0 && elapsed > 0.0 {
        println!(
            "[Generated {tokens} tokens in {elapsed:.2}s - {:.2} tokens/sec]",
            tokens as f64 / elapsed
        );
    }
}

fn main() {
    // Clean log format: message only, no timestamp/module prefix.
    env_logger::Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let matches = cli().get_matches();
    if let Err(e) = run(&matches) {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
