// Raster optimizer - Main Entry Point
//
// Loads a target image and a hardware palette, runs the stochastic
// optimiser and writes the resulting raster program, sprite data and
// preview picture whenever the autosave period elapses and at the end.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use log::{info, warn};

use raster_rs::config::{DualInit, InitMode, OptimizerConfig};
use raster_rs::emulator::EvalContext;
use raster_rs::output::{self, ProgramHeader};
use raster_rs::palette::{DistanceMetric, Palette, Rgb};
use raster_rs::program::{generator, RasterPicture};
use raster_rs::rng::XorShift;
use raster_rs::target::{OnOffMap, TargetImage, MAX_HEIGHT, SCREEN_WIDTH};
use raster_rs::{AcceptanceMode, DualOptimizer, MutationKind, Optimizer, Update};

/// Seconds between time-based autosaves when no period is configured.
const AUTOSAVE_SECS: u64 = 30;

struct Args {
    input: PathBuf,
    output: PathBuf,
    palette: Option<PathBuf>,
    onoff: Option<PathBuf>,
    height_limit: Option<usize>,
    config: OptimizerConfig,
}

fn usage() {
    eprintln!("Usage: raster-rs [options] <input.png>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --palette <file.act>     128-entry RGB palette (default: grey ramp)");
    eprintln!("  --output <stem>          output file stem (default: input stem)");
    eprintln!("  --onoff <file>           per-line register enable map");
    eprintln!("  --height <n>             use only the top n scanlines");
    eprintln!("  --threads <n>            worker threads (default 1)");
    eprintln!("  --seed <n>               RNG seed (default: time-based)");
    eprintln!("  --max-evals <n>          stop after n evaluations");
    eprintln!("  --solutions <n>          acceptance history length (default 1)");
    eprintln!("  --optimizer <dlas|lahc>  acceptance rule (default dlas)");
    eprintln!("  --distance <metric>      euclid | yuv | cie94 | ciede2000");
    eprintln!("  --init <mode>            random | empty | less");
    eprintln!("  --cache <mib>            per-worker cache budget in MiB");
    eprintln!("  --save-period <n>        autosave every n evaluations");
    eprintln!("  --unstuck-after <n>      plateau length before drift");
    eprintln!("  --unstuck-drift <f>      normalised drift per evaluation");
    eprintln!("  --dual                   optimise two blended frames");
    eprintln!("  --first-dual-steps <n>   bootstrap evaluations per frame");
    eprintln!("  --altering-dual-steps <n> evaluations between focus flips");
    eprintln!("  --after-dual <copy|fresh> frame B start mode");
    eprintln!("  --flicker-luma <f>       accepted luma flicker 0..1");
    eprintln!("  --flicker-chroma <f>     accepted chroma flicker 0..1");
    eprintln!("  --config <file.toml>     load configuration file first");
}

fn parse_args() -> Result<Args, String> {
    let mut config = OptimizerConfig::default();
    config.initial_seed = chrono::Utc::now().timestamp() as u64;

    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut palette: Option<PathBuf> = None;
    let mut onoff: Option<PathBuf> = None;
    let mut height_limit: Option<usize> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| -> Result<String, String> {
            args.next().ok_or_else(|| format!("{} needs a value", name))
        };
        match arg.as_str() {
            "--palette" => palette = Some(PathBuf::from(value("--palette")?)),
            "--output" => output = Some(PathBuf::from(value("--output")?)),
            "--onoff" => onoff = Some(PathBuf::from(value("--onoff")?)),
            "--height" => {
                height_limit = Some(
                    value("--height")?
                        .parse()
                        .map_err(|_| "bad --height".to_string())?,
                )
            }
            "--threads" => {
                config.threads = value("--threads")?
                    .parse()
                    .map_err(|_| "bad --threads".to_string())?
            }
            "--seed" => {
                config.initial_seed = value("--seed")?
                    .parse()
                    .map_err(|_| "bad --seed".to_string())?
            }
            "--max-evals" => {
                config.max_evals = value("--max-evals")?
                    .parse()
                    .map_err(|_| "bad --max-evals".to_string())?
            }
            "--solutions" => {
                config.solutions = value("--solutions")?
                    .parse()
                    .map_err(|_| "bad --solutions".to_string())?
            }
            "--optimizer" => {
                let name = value("--optimizer")?;
                config.optimizer = AcceptanceMode::from_name(&name)
                    .ok_or_else(|| format!("unknown optimizer '{}'", name))?;
            }
            "--distance" => {
                let name = value("--distance")?;
                config.distance = DistanceMetric::from_name(&name)
                    .ok_or_else(|| format!("unknown distance metric '{}'", name))?;
            }
            "--init" => {
                let name = value("--init")?;
                config.init = InitMode::from_name(&name)
                    .ok_or_else(|| format!("unknown init mode '{}'", name))?;
            }
            "--cache" => {
                let mib: f64 = value("--cache")?
                    .parse()
                    .map_err(|_| "bad --cache".to_string())?;
                config.cache_size = (mib.max(1.0) * 1024.0 * 1024.0) as usize;
            }
            "--save-period" => {
                config.save_period = value("--save-period")?
                    .parse()
                    .map_err(|_| "bad --save-period".to_string())?
            }
            "--unstuck-after" => {
                config.unstuck_after = value("--unstuck-after")?
                    .parse()
                    .map_err(|_| "bad --unstuck-after".to_string())?
            }
            "--unstuck-drift" => {
                config.unstuck_drift_norm = value("--unstuck-drift")?
                    .parse()
                    .map_err(|_| "bad --unstuck-drift".to_string())?
            }
            "--dual" => config.dual_mode = true,
            "--first-dual-steps" => {
                config.first_dual_steps = value("--first-dual-steps")?
                    .parse()
                    .map_err(|_| "bad --first-dual-steps".to_string())?
            }
            "--altering-dual-steps" => {
                config.altering_dual_steps = value("--altering-dual-steps")?
                    .parse()
                    .map_err(|_| "bad --altering-dual-steps".to_string())?
            }
            "--after-dual" => {
                let name = value("--after-dual")?;
                config.after_dual_steps = DualInit::from_name(&name)
                    .ok_or_else(|| format!("unknown --after-dual mode '{}'", name))?;
            }
            "--flicker-luma" => {
                config.flicker_luma_tol = value("--flicker-luma")?
                    .parse()
                    .map_err(|_| "bad --flicker-luma".to_string())?
            }
            "--flicker-chroma" => {
                config.flicker_chroma_tol = value("--flicker-chroma")?
                    .parse()
                    .map_err(|_| "bad --flicker-chroma".to_string())?
            }
            "--config" => {
                let path = value("--config")?;
                config = OptimizerConfig::load(&path)
                    .map_err(|e| format!("cannot load config '{}': {}", path, e))?;
            }
            "--help" | "-h" => return Err(String::new()),
            other if other.starts_with("--") => return Err(format!("unknown option '{}'", other)),
            other => input = Some(PathBuf::from(other)),
        }
    }

    let input = input.ok_or_else(|| "no input image given".to_string())?;
    let output = output.unwrap_or_else(|| input.with_extension(""));
    Ok(Args {
        input,
        output,
        palette,
        onoff,
        height_limit,
        config,
    })
}

/// Decode the target PNG into RGB pixels, clamped to the display height.
fn load_target(path: &Path, height_limit: Option<usize>) -> Result<(usize, usize, Vec<Rgb>), String> {
    let file = std::fs::File::open(path).map_err(|e| format!("cannot open {:?}: {}", path, e))?;
    let decoder = png::Decoder::new(std::io::BufReader::new(file));
    let mut reader = decoder
        .read_info()
        .map_err(|e| format!("cannot decode {:?}: {}", path, e))?;
    let mut buf = vec![0; reader.output_buffer_size().expect("image too large for memory")];
    let frame = reader
        .next_frame(&mut buf)
        .map_err(|e| format!("cannot decode {:?}: {}", path, e))?;

    let width = frame.width as usize;
    let mut height = frame.height as usize;
    if width != SCREEN_WIDTH {
        return Err(format!(
            "input must be {} pixels wide, got {} (rescale it first)",
            SCREEN_WIDTH, width
        ));
    }
    height = height.min(MAX_HEIGHT);
    if let Some(limit) = height_limit {
        height = height.min(limit.max(1));
    }

    let channels = match frame.color_type {
        png::ColorType::Rgb => 3,
        png::ColorType::Rgba => 4,
        png::ColorType::Grayscale => 1,
        other => return Err(format!("unsupported PNG colour type {:?}", other)),
    };

    let mut pixels = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let at = (y * width + x) * channels;
            let px = match channels {
                1 => Rgb::new(buf[at], buf[at], buf[at]),
                _ => Rgb::new(buf[at], buf[at + 1], buf[at + 2]),
            };
            pixels.push(px);
        }
    }
    Ok((width, height, pixels))
}

struct OutputWriter {
    stem: PathBuf,
    input_name: String,
    seed: u64,
    palette: Palette,
}

impl OutputWriter {
    fn save_single(&self, opt: &Optimizer) {
        let snap = opt.snapshot();
        let header = ProgramHeader {
            input_file: self.input_name.clone(),
            evaluations: snap.evaluations,
            score: snap.normalized_cost,
            seed: self.seed,
        };
        self.write_all("", &snap.picture, &header, &snap.painted, &snap.painted_targets, &snap.sprites);
        let stats_path = self.stem.with_extension("csv");
        if let Err(e) = output::save_statistics(
            &stats_path,
            &snap.statistics,
            snap.painted.first().map(|r| r.len()).unwrap_or(0),
            snap.painted.len(),
        ) {
            warn!("saving {:?} failed: {}", stats_path, e);
        }
    }

    fn save_dual(&self, opt: &DualOptimizer) {
        let snap = opt.snapshot();
        let header = ProgramHeader {
            input_file: self.input_name.clone(),
            evaluations: snap.evaluations,
            score: snap.normalized_cost,
            seed: self.seed,
        };
        self.write_all("", &snap.picture, &header, &snap.painted, &snap.painted_targets, &snap.sprites);

        if let Some((pic_b, painted_b, targets_b, sprites_b)) = opt.snapshot_b() {
            let header_b = ProgramHeader {
                input_file: self.input_name.clone(),
                evaluations: snap.evaluations,
                score: snap.normalized_cost,
                seed: self.seed,
            };
            self.write_all("-b", &pic_b, &header_b, &painted_b, &targets_b, &sprites_b);
        }

        let blended = opt.blended_preview();
        let path = self.with_suffix("-blended-output.png");
        if let Err(e) = output::save_png(&path, &blended) {
            warn!("saving {:?} failed: {}", path, e);
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .stem
            .file_name()
            .map(|s| s.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        self.stem.with_file_name(name)
    }

    fn write_all(
        &self,
        tag: &str,
        pic: &RasterPicture,
        header: &ProgramHeader,
        painted: &[Vec<u8>],
        painted_targets: &[Vec<u8>],
        sprites: &[[[bool; 8]; 4]],
    ) {
        let rp = self.with_suffix(&format!("{}.rp", tag));
        if let Err(e) = output::save_raster_program(&rp, pic, header) {
            warn!("saving {:?} failed: {}", rp, e);
        }
        let pmg = self.with_suffix(&format!("{}.pmg", tag));
        if let Err(e) = output::save_pmg(&pmg, sprites) {
            warn!("saving {:?} failed: {}", pmg, e);
        }
        let mic = self.with_suffix(&format!("{}.mic", tag));
        if let Err(e) = output::save_screen_data(&mic, painted_targets) {
            warn!("saving {:?} failed: {}", mic, e);
        }
        let preview = self.with_suffix(&format!("{}-output.png", tag));
        let rgb = output::painted_to_rgb(painted, &self.palette);
        if let Err(e) = output::save_png(&preview, &rgb) {
            warn!("saving {:?} failed: {}", preview, e);
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {}", msg);
                eprintln!();
            }
            usage();
            return ExitCode::from(2);
        }
    };

    let palette = match &args.palette {
        Some(path) => match Palette::load(path) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("error: cannot load palette {:?}: {}", path, e);
                return ExitCode::from(2);
            }
        },
        None => {
            warn!("no palette given, using a grey ramp");
            Palette::grayscale()
        }
    };

    let (width, height, pixels) = match load_target(&args.input, args.height_limit) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    info!("target: {}x{} pixels, metric {:?}", width, height, args.config.distance);

    let target = TargetImage::new(width, height, pixels, &palette, args.config.distance);

    let onoff = match &args.onoff {
        Some(path) => match OnOffMap::load(path, height) {
            Ok(map) => Some(map),
            Err(e) => {
                eprintln!("error: cannot load on/off map {:?}: {}", path, e);
                return ExitCode::from(2);
            }
        },
        None => None,
    };

    let initial = match args.config.init {
        InitMode::Empty => generator::empty_picture(height),
        InitMode::Less => generator::low_color_picture(&target, height),
        InitMode::Random => {
            let mut rng = XorShift::new(args.config.initial_seed);
            generator::random_picture(&target, &mut rng)
        }
    };

    let ctx = EvalContext {
        target,
        palette: palette.clone(),
        onoff,
        thread_count: args.config.threads.max(1),
        unstuck_after: args.config.unstuck_after,
    };

    let writer = OutputWriter {
        stem: args.output.clone(),
        input_name: args.input.display().to_string(),
        seed: args.config.initial_seed,
        palette,
    };

    info!(
        "starting {} worker(s), seed {}, {:?} acceptance",
        args.config.threads, args.config.initial_seed, args.config.optimizer
    );

    if args.config.dual_mode {
        let mut opt = match DualOptimizer::new(ctx, args.config.clone()) {
            Ok(opt) => opt,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::from(2);
            }
        };
        opt.start(initial);
        drive(
            &|timeout| opt.wait_update(timeout),
            &|| writer.save_dual(&opt),
            &|| {
                let snap = opt.snapshot();
                (snap.evaluations, snap.normalized_cost)
            },
            args.config.save_period,
        );
        opt.join();
        writer.save_dual(&opt);
        let snap = opt.snapshot();
        println!(
            "done: {} evaluations, final score {:.6}",
            snap.evaluations, snap.normalized_cost
        );
        print_mutation_stats(&snap.mutation_stats);
    } else {
        let mut opt = match Optimizer::new(ctx, args.config.clone()) {
            Ok(opt) => opt,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::from(2);
            }
        };
        opt.start(initial);
        drive(
            &|timeout| opt.wait_update(timeout),
            &|| writer.save_single(&opt),
            &|| {
                let snap = opt.snapshot();
                (snap.evaluations, snap.normalized_cost)
            },
            args.config.save_period,
        );
        opt.join();
        writer.save_single(&opt);
        let snap = opt.snapshot();
        println!(
            "done: {} evaluations, final score {:.6}",
            snap.evaluations, snap.normalized_cost
        );
        print_mutation_stats(&snap.mutation_stats);
    }

    ExitCode::SUCCESS
}

/// Per-operator counts of mutations that took part in accepted
/// improvements.
fn print_mutation_stats(stats: &[u64; raster_rs::MUTATION_COUNT]) {
    println!("accepted mutations by operator:");
    for kind in MutationKind::ALL {
        println!("  {:>10}  {}", stats[kind as usize], kind.name());
    }
}

/// Event loop shared by the single and dual paths: print improvements,
/// autosave on the configured cadence and return when finished.
fn drive(
    wait: &dyn Fn(Duration) -> Update,
    save: &dyn Fn(),
    progress: &dyn Fn() -> (u64, f64),
    save_period: i64,
) {
    let mut last_save = Instant::now();
    let mut last_report = Instant::now();
    loop {
        match wait(Duration::from_millis(250)) {
            Update::Finished => return,
            Update::Autosave => {
                save();
                last_save = Instant::now();
            }
            Update::Improved => {
                if last_report.elapsed() >= Duration::from_secs(1) {
                    let (evaluations, score) = progress();
                    println!("evaluations: {:>12}  score: {:.6}", evaluations, score);
                    last_report = Instant::now();
                }
            }
            Update::Initialized | Update::Tick => {}
        }
        if save_period == -1 && last_save.elapsed() >= Duration::from_secs(AUTOSAVE_SECS) {
            save();
            last_save = Instant::now();
        }
    }
}
