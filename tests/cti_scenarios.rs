//! End-to-end scenarios for the CTI forward model and correction loop.

use approx::assert_relative_eq;
use ndarray::{array, Array2};

use ctisim::{
    add_cti, remove_cti, CCDPhase, CtiParams, TrapInstantCapture, TrapInstantCaptureContinuum,
    TrapList, TrapSlowCapture, CCD, ROE,
};

/// One instant-capture species, release half-life of one dwell, linear well.
fn standard_params(express: usize) -> CtiParams {
    let trap = TrapInstantCapture::new(10.0, -1.0 / 0.5_f64.ln()).unwrap();
    let traps = TrapList {
        instant_capture: vec![trap],
        ..TrapList::default()
    };
    let roe = ROE::new(vec![1.0], true, true).unwrap();
    let ccd = CCD::new(CCDPhase::new(1000.0, 0.0, 1.0).unwrap());
    CtiParams::new(roe, ccd, traps, express)
}

fn single_source_column() -> Array2<f64> {
    array![[0.0], [0.0], [0.0], [100.0], [0.0], [0.0], [0.0]]
}

#[test]
fn single_pixel_smear() {
    let image = single_source_column();
    let output = add_cti(&image, Some(&standard_params(0)), None).unwrap();

    // Rows nearer the register than the source never see charge
    for r in 0..3 {
        assert_eq!(output[[r, 0]], 0.0, "row {r} gained charge from nothing");
    }

    // The source loses charge; the trail behind it decays geometrically
    let lost = 100.0 - output[[3, 0]];
    assert!(lost > 0.0);
    let trail = [output[[4, 0]], output[[5, 0]], output[[6, 0]]];
    assert!(trail[0] > trail[1] && trail[1] > trail[2]);
    assert!(trail[2] > 0.0);
    let ratio_a = trail[1] / trail[0];
    let ratio_b = trail[2] / trail[1];
    assert!(
        (ratio_a - ratio_b).abs() < 0.2,
        "trail decay is far from geometric: {ratio_a} vs {ratio_b}"
    );

    // Charge in the visible trail cannot exceed what the source lost; the
    // remainder is still trapped beyond the last row
    let trail_sum: f64 = trail.iter().sum();
    assert!(trail_sum <= lost + 1e-9);
    assert!(trail_sum > 0.5 * lost);
}

#[test]
fn round_trip_recovers_the_input() {
    let image = single_source_column();
    let trailed = add_cti(&image, Some(&standard_params(0)), None).unwrap();
    let corrected = remove_cti(&trailed, 5, Some(&standard_params(0)), None).unwrap();

    for (corrected_value, original_value) in corrected.iter().zip(image.iter()) {
        assert_relative_eq!(corrected_value, original_value, epsilon = 1e-2);
    }
}

#[test]
fn zero_image_is_invariant() {
    let image = Array2::<f64>::zeros((20, 4));

    let trailed = add_cti(&image, Some(&standard_params(0)), None).unwrap();
    assert_eq!(trailed, image);

    let corrected = remove_cti(&image, 4, Some(&standard_params(0)), None).unwrap();
    assert_eq!(corrected, image);
}

#[test]
fn below_notch_signals_are_quiescent() {
    let trap = TrapInstantCapture::new(10.0, 1.0).unwrap();
    let traps = TrapList {
        instant_capture: vec![trap],
        ..TrapList::default()
    };
    let ccd = CCD::new(CCDPhase::new(1000.0, 100.0, 1.0).unwrap());
    let params = CtiParams::new(ROE::default(), ccd, traps, 0);

    // Everything below the notch: no cloud ever forms, no capture possible
    let image = Array2::from_shape_fn((15, 3), |(r, c)| (r * 3 + c) as f64 * 2.0);
    assert!(image.iter().all(|&v| v < 100.0));

    let output = add_cti(&image, Some(&params), None).unwrap();
    for (out, orig) in output.iter().zip(image.iter()) {
        assert_relative_eq!(out, orig, epsilon = 1e-4);
    }
}

#[test]
fn identical_columns_stay_identical() {
    // Between-column resets make columns independent of content and order
    let mut image = Array2::<f64>::zeros((10, 4));
    for r in 0..10 {
        let value = if r == 2 { 300.0 } else { (r as f64) * 7.0 };
        image[[r, 0]] = value;
        image[[r, 3]] = value;
        image[[r, 1]] = 1000.0 - value;
    }

    let output = add_cti(&image, Some(&standard_params(0)), None).unwrap();
    for r in 0..10 {
        assert_relative_eq!(output[[r, 0]], output[[r, 3]], epsilon = 1e-12);
    }
}

#[test]
fn express_matrix_sums_are_exact() {
    let roe = ROE::default();
    for &express in &[1_usize, 5, 10, 200, 2000] {
        let matrix = roe.express_matrix(2000, express, 0);
        for r in 0..2000 {
            assert_relative_eq!(
                matrix.column_sum(r),
                (r + 1) as f64,
                epsilon = 1e-9,
                max_relative = 1e-12
            );
        }
    }
}

#[test]
fn charge_is_conserved_once_trails_drain() {
    // A long empty tail lets the traps hand every captured electron back
    let n_rows = 120;
    let mut image = Array2::<f64>::zeros((n_rows, 1));
    image[[3, 0]] = 100.0;
    let total_in: f64 = image.sum();

    let output = add_cti(&image, Some(&standard_params(0)), None).unwrap();
    let total_out: f64 = output.sum();
    assert_relative_eq!(total_out, total_in, epsilon = 1e-6);
}

#[test]
fn exact_express_schedules_agree() {
    // express = 0 and express = n_rows both mean one pass per transfer
    let mut image = Array2::<f64>::zeros((32, 2));
    image[[5, 0]] = 120.0;
    image[[17, 0]] = 800.0;
    image[[9, 1]] = 55.0;

    let exact = add_cti(&image, Some(&standard_params(0)), None).unwrap();
    let explicit = add_cti(&image, Some(&standard_params(32)), None).unwrap();

    for (a, b) in exact.iter().zip(explicit.iter()) {
        assert_relative_eq!(a, b, max_relative = 1e-6, epsilon = 1e-9);
    }
}

#[test]
fn small_express_approximates_the_exact_schedule() {
    let mut image = Array2::<f64>::zeros((64, 1));
    image[[10, 0]] = 500.0;

    let exact = add_cti(&image, Some(&standard_params(0)), None).unwrap();
    let approximate = add_cti(&image, Some(&standard_params(8)), None).unwrap();

    // Same total charge and a close per-pixel match
    assert_relative_eq!(approximate.sum(), exact.sum(), max_relative = 1e-6);
    for (a, b) in approximate.iter().zip(exact.iter()) {
        assert!((a - b).abs() < 5.0, "express=8 diverged: {a} vs {b}");
    }
}

#[test]
fn parallel_then_serial_trails_both_axes() {
    let mut image = Array2::<f64>::zeros((8, 8));
    image[[3, 3]] = 500.0;

    let parallel = standard_params(0);
    let serial = standard_params(0);
    let output = add_cti(&image, Some(&parallel), Some(&serial)).unwrap();

    // Trails extend along both axes away from the registers
    assert!(output[[4, 3]] > 0.0);
    assert!(output[[3, 4]] > 0.0);
    assert!(output[[3, 3]] < 500.0);
    // The corner ahead of both registers stays empty
    assert_eq!(output[[2, 2]], 0.0);
}

#[test]
fn every_species_group_contributes_a_trail() {
    let traps = TrapList {
        instant_capture: vec![TrapInstantCapture::new(4.0, 1.2).unwrap()],
        slow_capture: vec![TrapSlowCapture::new(3.0, 2.0, 0.3).unwrap()],
        instant_capture_continuum: vec![
            TrapInstantCaptureContinuum::new(2.0, 1.0, 0.6).unwrap(),
        ],
        ..TrapList::default()
    };
    let ccd = CCD::new(CCDPhase::new(1e4, 0.0, 1.0).unwrap());
    let all = CtiParams::new(ROE::default(), ccd.clone(), traps.clone(), 0);

    let mut image = Array2::<f64>::zeros((12, 1));
    image[[2, 0]] = 1000.0;
    let output_all = add_cti(&image, Some(&all), None).unwrap();
    let lost_all = 1000.0 - output_all[[2, 0]];

    // Dropping a group weakens the trail
    let fewer = CtiParams::new(
        ROE::default(),
        ccd,
        TrapList {
            instant_capture: traps.instant_capture.clone(),
            ..TrapList::default()
        },
        0,
    );
    let output_fewer = add_cti(&image, Some(&fewer), None).unwrap();
    let lost_fewer = 1000.0 - output_fewer[[2, 0]];

    assert!(lost_all > lost_fewer);
    assert!(lost_fewer > 0.0);
}

#[test]
fn pruning_preserves_the_bright_pixels() {
    let mut image = Array2::<f64>::zeros((40, 1));
    image[[4, 0]] = 2000.0;

    let mut pruned = standard_params(0);
    pruned.roe.prune_n_electrons = 0.5;
    pruned.roe.prune_frequency = 10;
    let with_pruning = add_cti(&image, Some(&pruned), None).unwrap();

    let without = add_cti(&image, Some(&standard_params(0)), None).unwrap();

    // The bright pixel and the near trail agree closely; pruning only skips
    // nearly-empty transfers
    assert_relative_eq!(
        with_pruning[[4, 0]],
        without[[4, 0]],
        max_relative = 1e-3
    );
    assert_relative_eq!(
        with_pruning[[5, 0]],
        without[[5, 0]],
        max_relative = 1e-2
    );
}

#[test]
fn window_limits_the_clocked_rows() {
    let mut image = Array2::<f64>::zeros((16, 1));
    image[[2, 0]] = 400.0;
    image[[12, 0]] = 400.0;

    let mut params = standard_params(0);
    params.window_start = 0;
    params.window_stop = 8;
    let output = add_cti(&image, Some(&params), None).unwrap();

    // Inside the window the source trails; outside it nothing happens
    assert!(output[[2, 0]] < 400.0);
    assert_eq!(output[[12, 0]], 400.0);
}
