// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

use clap::{Parser, Subcommand};
use detprep::{
    ConfigOverrides, Error, PipelineConfig, PipelineRunner, Progress, StageStatus,
    utils::progress_line, visualize,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Text};
use std::{
    path::PathBuf,
    sync::mpsc::{self, Sender},
    thread::JoinHandle,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, defaults to detprep.toml in the user config
    /// directory
    #[clap(long, env = "DETPREP_CONFIG")]
    config: Option<PathBuf>,

    /// Playground directory receiving every generated file
    #[clap(long)]
    playground: Option<PathBuf>,

    /// Annotations directory, one sub-directory of .xml files per label
    #[clap(long)]
    annotations: Option<PathBuf>,

    /// Images directory, one sub-directory of images per label
    #[clap(long)]
    images: Option<PathBuf>,

    /// Seed for augmentation and the train/test split
    #[clap(long)]
    seed: Option<u64>,

    /// External trainer program
    #[clap(long)]
    trainer: Option<PathBuf>,

    /// Pipeline Command
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Delete annotations without images and images without annotations, then
    /// copy the images into the playground's allImages directory.
    Clean,
    /// Convert the XML annotations and cleaned images into
    /// dataset/original.arrow.
    Convert,
    /// Augment the original dataset, writing allAugmentedImages and
    /// dataset/augmented.arrow and dataset/final.arrow.
    Augment {
        /// Also render the original ground truth boxes into the playground's
        /// original directory
        #[clap(long)]
        visualize_original: bool,
    },
    /// Train, evaluate and export a model with the external trainer.
    Train {
        /// Dataset to train on, defaults to dataset/final.arrow
        #[clap(long)]
        dataset: Option<PathBuf>,

        /// Fraction of rows used for training
        #[clap(long)]
        split: Option<f64>,

        /// Maximum training iterations
        #[clap(long)]
        max_iterations: Option<u32>,

        /// Model file name, without extension
        #[clap(long)]
        model_name: Option<String>,
    },
    /// Predict on test images with the saved model and write the images with
    /// their predicted boxes into the playground's predictions directory.
    Visualize {
        /// Test images directory, defaults to allImages
        #[clap(long)]
        test_images: Option<PathBuf>,

        /// Model file name, without extension
        #[clap(long)]
        model_name: Option<String>,
    },
    /// Print the first rows of a dataset that have images.
    Explore {
        /// Dataset file, defaults to dataset/final.arrow
        dataset: Option<PathBuf>,

        /// Number of rows to show
        #[clap(long, default_value = "10")]
        limit: usize,

        /// Write the shown rows with their ground truth boxes into this
        /// directory
        #[clap(long)]
        draw: Option<PathBuf>,
    },
    /// Run every stage whose inputs changed since the last run.
    Run {
        /// Prompt for the directories instead of reading the configuration
        #[clap(long, short)]
        interactive: bool,

        /// Also render the original ground truth boxes into the playground's
        /// original directory
        #[clap(long)]
        visualize_original: bool,
    },
}

fn prompt_error(err: inquire::InquireError) -> Error {
    Error::InvalidParameters(format!("prompt failed: {}", err))
}

fn prompt_dir(message: &str, current: &std::path::Path) -> Result<PathBuf, Error> {
    let answer = Text::new(message)
        .with_default(&current.to_string_lossy())
        .prompt()
        .map_err(prompt_error)?;
    Ok(PathBuf::from(answer.trim()))
}

/// Render progress updates until every sender is dropped.
fn progress_bar() -> (Sender<Progress>, JoinHandle<()>) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise} ETA: {eta}] {msg}: {wide_bar:.yellow} {human_pos}/{human_len}",
        )
        .unwrap()
        .progress_chars("█▇▆▅▄▃▂▁  "),
    );

    let (tx, rx) = mpsc::channel::<Progress>();

    let handle = std::thread::spawn(move || {
        for progress in rx {
            let status = progress.status.unwrap_or_default();
            if bar.is_hidden() {
                if progress.current == progress.total {
                    let (current, total) = (progress.current, progress.total);
                    let prefix = format!("({}) {}/{} files:", status, current, total);
                    eprintln!("{}", progress_line(current, total, &prefix, "", 1, 50, '█'));
                }
                continue;
            }
            if progress.total > 0 {
                bar.set_message(status);
                bar.set_length(progress.total as u64);
                bar.set_position(progress.current as u64);
            }
        }
        bar.finish_and_clear();
    });

    (tx, handle)
}

fn handle_clean(runner: &mut PipelineRunner) -> Result<(), Error> {
    let report = runner.clean()?;
    for label in &report.labels {
        println!(
            "{}: {} annotations, {} images, {} common, {} deleted, {} copied",
            label.label,
            label.annotation_files,
            label.image_files,
            label.common,
            label.deleted_annotations.len() + label.deleted_images.len(),
            label.copied
        );
    }
    Ok(())
}

fn handle_train(runner: &mut PipelineRunner) -> Result<(), Error> {
    let report = runner.train()?;
    println!("Train rows: {}", report.train_rows);
    println!("Test rows: {}", report.test_rows);
    for (name, value) in &report.metrics {
        println!("{}: {}", name, value);
    }
    println!("Model: {}", report.model_path.display());
    println!("Export: {}", report.export_path.display());
    Ok(())
}

fn handle_explore(
    config: &PipelineConfig,
    dataset: Option<PathBuf>,
    limit: usize,
    draw: Option<PathBuf>,
) -> Result<(), Error> {
    let dataset = dataset.unwrap_or_else(|| config.training_dataset());
    let summary = visualize::explore(&dataset, limit, draw.as_deref())?;
    println!("{}", summary);
    Ok(())
}

fn handle_run(runner: &mut PipelineRunner, explore: bool) -> Result<(), Error> {
    for outcome in runner.run()? {
        match outcome.status {
            StageStatus::Ran => println!("{}: done", outcome.stage),
            StageStatus::Skipped => println!("{}: using results from previous run", outcome.stage),
        }
    }
    if explore {
        handle_explore(runner.config(), None, 10, None)?;
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = PipelineConfig::load(args.config.as_deref())?;
    let mut overrides = ConfigOverrides {
        playground_dir: args.playground,
        annotations_dir: args.annotations,
        images_dir: args.images,
        seed: args.seed,
        trainer_program: args.trainer,
        ..Default::default()
    };

    match &args.cmd {
        Command::Train {
            dataset,
            split,
            max_iterations,
            model_name,
        } => {
            overrides.training_dataset = dataset.clone();
            overrides.train_test_split = *split;
            overrides.max_iterations = *max_iterations;
            overrides.model_name = model_name.clone();
        }
        Command::Visualize {
            test_images,
            model_name,
        } => {
            overrides.test_images_dir = test_images.clone();
            overrides.model_name = model_name.clone();
        }
        Command::Augment { visualize_original } | Command::Run { visualize_original, .. } => {
            if *visualize_original {
                overrides.visualize_original = Some(true);
            }
        }
        _ => {}
    }
    config.apply(overrides);
    log::debug!("configuration: {:?}", config);

    let mut explore = config.explore;
    if let Command::Run {
        interactive: true, ..
    } = args.cmd
    {
        config.playground_dir = prompt_dir("Playground Directory:", &config.playground_dir)?;
        config.annotations_dir =
            prompt_dir("Annotations Directory (this can be unclean):", &config.annotations_dir)?;
        config.images_dir =
            prompt_dir("Images Directory (this can be unclean):", &config.images_dir)?;
        explore = Confirm::new("Explore the final dataset?")
            .with_default(explore)
            .prompt()
            .map_err(prompt_error)?;
    }

    if let Command::Explore { dataset, limit, draw } = args.cmd {
        config.validate()?;
        return handle_explore(&config, dataset, limit, draw);
    }

    let runner = PipelineRunner::new(config)?;
    let (tx, handle) = progress_bar();
    let result = {
        let mut runner = runner.with_progress(tx);
        match args.cmd {
            Command::Clean => handle_clean(&mut runner),
            Command::Convert => runner.convert().map(|rows| println!("Converted {} rows", rows)),
            Command::Augment { .. } => runner
                .augment()
                .map(|rows| println!("Final dataset has {} rows", rows)),
            Command::Train { .. } => handle_train(&mut runner),
            Command::Visualize { .. } => runner.visualize().map(|written| {
                for path in written {
                    println!("{}", path.display());
                }
            }),
            Command::Run { .. } => handle_run(&mut runner, explore),
            Command::Explore { .. } => unreachable!(),
        }
    };
    if handle.join().is_err() {
        log::error!("progress display thread panicked");
    }
    result
}
