//! Command-line harness for the CTI model.
//!
//! `ctisim --demo` writes a small test image, adds parallel and serial CTI
//! trails, removes them again, and saves the result. A good place to edit
//! for quick experiments without any wrapper code. `ctisim --benchmark`
//! clocks a synthetic image and reports the elapsed time, e.g. for
//! profiling.

use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{debug, info};
use ndarray::{array, Array2};

use ctisim::{
    add_cti, load_image_from_txt, remove_cti, save_image_to_txt, CCDPhase, CtiError, CtiParams,
    TrapInstantCapture, TrapList, CCD, ROE,
};

#[derive(Parser, Debug)]
#[command(
    name = "ctisim",
    about = "Add or remove charge-transfer-inefficiency trails in CCD images",
    long_about = "Add or remove image trails due to charge transfer inefficiency in CCD \
                  detectors by modelling the trapping, releasing, and moving of charge \
                  along pixels."
)]
struct Args {
    /// Printed information: 0 errors only, 1 standard, 2 extra details
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    verbosity: u8,

    /// Run the demo: write a test image, add CTI, then remove it again
    #[arg(short, long)]
    demo: bool,

    /// Clock a synthetic image and report the elapsed time
    #[arg(short, long)]
    benchmark: bool,
}

fn demo_params() -> Result<CtiParams, CtiError> {
    // One instant-capture species with a release half-life of one dwell
    let trap = TrapInstantCapture::new(10.0, -1.0 / 0.5_f64.ln())?;
    let traps = TrapList {
        instant_capture: vec![trap],
        ..TrapList::default()
    };
    let roe = ROE::new(vec![1.0], true, true)?;
    let ccd = CCD::new(CCDPhase::new(1e3, 0.0, 1.0)?);
    Ok(CtiParams::new(roe, ccd, traps, 0))
}

fn run_demo() -> Result<(), CtiError> {
    let image_pre_cti = array![
        [0.0, 0.0, 0.0, 0.0],
        [200.0, 0.0, 0.0, 0.0],
        [0.0, 200.0, 0.0, 0.0],
        [0.0, 0.0, 200.0, 0.0],
        [0.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 0.0, 0.0],
    ];
    save_image_to_txt("image_test_pre_cti.txt", &image_pre_cti)?;

    let image_pre_cti = load_image_from_txt("image_test_pre_cti.txt")?;
    info!("Loaded test image from image_test_pre_cti.txt:");
    info!("{image_pre_cti:.4}");

    let parallel = demo_params()?;
    let serial = demo_params()?;

    info!("Add CTI");
    let image_post_cti = add_cti(&image_pre_cti, Some(&parallel), Some(&serial))?;
    info!("Image with CTI added:");
    info!("{image_post_cti:.4}");

    info!("Remove CTI");
    let n_iterations = 3;
    let image_removed = remove_cti(&image_post_cti, n_iterations, Some(&parallel), Some(&serial))?;
    info!("Image with CTI removed:");
    info!("{image_removed:.4}");

    save_image_to_txt("image_test_cti_removed.txt", &image_removed)?;
    info!("Saved final image to image_test_cti_removed.txt");

    Ok(())
}

fn run_benchmark() -> Result<(), CtiError> {
    // A bright streak every 50 rows over a faint background, roughly the
    // shape of a sparse astronomical exposure
    let n_rows = 2048;
    let n_cols = 10;
    let image = Array2::from_shape_fn((n_rows, n_cols), |(r, c)| {
        if r % 50 == (c * 7) % 50 {
            2e4
        } else {
            30.0
        }
    });

    let trap = TrapInstantCapture::new(10.0, -1.0 / 0.5_f64.ln())?;
    let traps = TrapList {
        instant_capture: vec![trap],
        ..TrapList::default()
    };
    let roe = ROE::new(vec![1.0], true, false)?;
    let ccd = CCD::new(CCDPhase::new(1e4, 0.0, 1.0)?);
    let params = CtiParams::new(roe, ccd, traps, 5);

    let start = Instant::now();
    let trailed = add_cti(&image, Some(&params), None)?;
    let elapsed = start.elapsed();

    let total_in: f64 = image.sum();
    let total_out: f64 = trailed.sum();
    info!(
        "Clocked {n_rows}x{n_cols} pixels with express 5 in {:.3} s",
        elapsed.as_secs_f64()
    );
    debug!("Image sum {total_in:.1} -> {total_out:.1}");

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();

    let result = if args.demo {
        info!("Running demo");
        run_demo()
    } else if args.benchmark {
        info!("Running benchmark");
        run_benchmark()
    } else {
        Ok(())
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
