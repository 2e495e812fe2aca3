//! GPU integration tests for the CUDA backend.
//! Run on a machine with a CUDA device: cargo test -- --nocapture
//!
//! Every test bails out early when no device is present, so the suite is
//! safe to run on CPU-only CI.

use synapse_cuda::{is_cuda_available, BackendError, Handler, HandlerOptions};

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "element {} differs: {} vs {} (tol={})",
            i, x, y, tol
        );
    }
}

macro_rules! require_gpu {
    () => {
        if !is_cuda_available() {
            eprintln!("skipping: no CUDA device");
            return;
        }
    };
}

fn handler() -> Handler {
    Handler::new(0).expect("handler init")
}

// ============================================================================
// Buffers and transfers
// ============================================================================

#[test]
fn test_zeros_and_ones() {
    require_gpu!();
    let h = handler();
    let z = h.zeros(&[2, 3]).unwrap();
    assert_eq!(h.get_host_copy(&z).unwrap(), vec![0.0; 6]);

    let o = h.ones(&[2, 3]).unwrap();
    assert_eq!(h.get_host_copy(&o).unwrap(), vec![1.0; 6]);
}

#[test]
fn test_host_roundtrip() {
    require_gpu!();
    let h = handler();
    let data = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
    let buf = h.create_from_host(&data, &[2, 3]).unwrap();
    assert_eq!(buf.shape(), &[2, 3]);
    assert_eq!(h.get_host_copy(&buf).unwrap(), data);
}

#[test]
fn test_set_from_host_checks_shape() {
    require_gpu!();
    let h = handler();
    let buf = h.zeros(&[2, 2]).unwrap();
    h.set_from_host(&buf, &[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    assert_eq!(h.get_host_copy(&buf).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

    let err = h.set_from_host(&buf, &[1.0, 2.0, 3.0, 4.0], &[4]).unwrap_err();
    assert!(matches!(err, BackendError::ShapeMismatch { .. }), "{}", err);
}

#[test]
fn test_copy_to() {
    require_gpu!();
    let h = handler();
    let src = h.create_from_host(&[1.0, 2.0, 3.0], &[3]).unwrap();
    let dst = h.zeros(&[3]).unwrap();
    h.copy_to(&dst, &src).unwrap();
    assert_eq!(h.get_host_copy(&dst).unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_fill() {
    require_gpu!();
    let h = handler();
    let buf = h.zeros(&[5]).unwrap();
    h.fill(&buf, 2.5).unwrap();
    assert_eq!(h.get_host_copy(&buf).unwrap(), vec![2.5; 5]);
}

#[test]
fn test_reshape_is_a_view() {
    require_gpu!();
    let h = handler();
    let buf = h.create_from_host(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let flat = buf.reshape(&[6]).unwrap();
    assert_eq!(flat.shape(), &[6]);

    // A write through one handle is visible through the other.
    h.fill(&flat, 9.0).unwrap();
    assert_eq!(h.get_host_copy(&buf).unwrap(), vec![9.0; 6]);

    let err = buf.reshape(&[4]).unwrap_err();
    assert!(matches!(err, BackendError::ShapeMismatch { .. }), "{}", err);
}

#[test]
fn test_slice_rows_view() {
    require_gpu!();
    let h = handler();
    let buf = h
        .create_from_host(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2])
        .unwrap();
    let mid = buf.slice_rows(1, 3);
    assert_eq!(mid.shape(), &[2, 2]);
    assert_eq!(h.get_host_copy(&mid).unwrap(), vec![3.0, 4.0, 5.0, 6.0]);
}

// ============================================================================
// Elementwise ops
// ============================================================================

#[test]
fn test_binary_elementwise() {
    require_gpu!();
    let h = handler();
    let a = h.create_from_host(&[1.0, 2.0, 3.0, 4.0], &[4]).unwrap();
    let b = h.create_from_host(&[5.0, 6.0, 7.0, 8.0], &[4]).unwrap();
    let out = h.zeros(&[4]).unwrap();

    h.add_tt(&a, &b, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![6.0, 8.0, 10.0, 12.0]);

    h.subtract_tt(&b, &a, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![4.0; 4]);

    h.mult_tt(&a, &b, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![5.0, 12.0, 21.0, 32.0]);

    h.divide_tt(&b, &a, &out).unwrap();
    assert_close(
        &h.get_host_copy(&out).unwrap(),
        &[5.0, 3.0, 7.0 / 3.0, 2.0],
        1e-6,
    );
}

#[test]
fn test_mult_add_accumulates() {
    require_gpu!();
    let h = handler();
    let a = h.create_from_host(&[1.0, 2.0], &[2]).unwrap();
    let b = h.create_from_host(&[3.0, 4.0], &[2]).unwrap();
    let out = h.create_from_host(&[10.0, 10.0], &[2]).unwrap();
    h.mult_add_tt(&a, &b, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![13.0, 18.0]);
}

#[test]
fn test_scalar_ops() {
    require_gpu!();
    let h = handler();
    let a = h.create_from_host(&[1.0, -2.0, 3.0], &[3]).unwrap();
    let out = h.zeros(&[3]).unwrap();

    h.mult_st(2.0, &a, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![2.0, -4.0, 6.0]);

    h.add_st(1.0, &a, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![2.0, -1.0, 4.0]);
}

#[test]
fn test_clip() {
    require_gpu!();
    let h = handler();
    let a = h.create_from_host(&[-5.0, -0.5, 0.0, 0.5, 5.0], &[5]).unwrap();
    let out = h.zeros(&[5]).unwrap();
    h.clip_t(&a, -1.0, 1.0, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
}

#[test]
fn test_log() {
    require_gpu!();
    let h = handler();
    let a = h.create_from_host(&[1.0, std::f32::consts::E, 10.0], &[3]).unwrap();
    let out = h.zeros(&[3]).unwrap();
    h.log_t(&a, &out).unwrap();
    assert_close(&h.get_host_copy(&out).unwrap(), &[0.0, 1.0, 10.0f32.ln()], 1e-5);
}

// ============================================================================
// Broadcast / gather ops
// ============================================================================

#[test]
fn test_broadcast_features() {
    require_gpu!();
    let h = handler();
    let a = h.create_from_host(&[1.0, 2.0, 3.0, 4.0], &[2, 2, 1]).unwrap();
    let out = h.zeros(&[2, 2, 3]).unwrap();
    h.broadcast_features_t(&a, &out).unwrap();
    assert_eq!(
        h.get_host_copy(&out).unwrap(),
        vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0]
    );
}

#[test]
fn test_binarize() {
    require_gpu!();
    let h = handler();
    let v = h.create_from_host(&[2.0, 0.0], &[2]).unwrap();
    let out = h.zeros(&[2, 3]).unwrap();
    h.binarize_v(&v, &out).unwrap();
    assert_eq!(
        h.get_host_copy(&out).unwrap(),
        vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]
    );
}

#[test]
fn test_index_by_vector() {
    require_gpu!();
    let h = handler();
    let m = h
        .create_from_host(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0], &[2, 3])
        .unwrap();
    let v = h.create_from_host(&[2.0, 0.0], &[2]).unwrap();
    let out = h.zeros(&[2]).unwrap();
    h.index_m_by_v(&m, &v, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![30.0, 40.0]);
}

#[test]
fn test_matrix_vector_broadcast_ops() {
    require_gpu!();
    let h = handler();
    let m = h
        .create_from_host(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
        .unwrap();
    let v = h.create_from_host(&[10.0, 20.0, 30.0], &[3]).unwrap();
    let out = h.zeros(&[2, 3]).unwrap();

    h.add_mv(&m, &v, &out).unwrap();
    assert_eq!(
        h.get_host_copy(&out).unwrap(),
        vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
    );

    h.mult_mv(&m, &v, &out).unwrap();
    assert_eq!(
        h.get_host_copy(&out).unwrap(),
        vec![10.0, 40.0, 90.0, 40.0, 100.0, 180.0]
    );

    h.divide_mv(&m, &v, &out).unwrap();
    assert_close(
        &h.get_host_copy(&out).unwrap(),
        &[0.1, 0.1, 0.1, 0.4, 0.25, 0.2],
        1e-6,
    );
}

#[test]
fn test_mult_mv_equal_shape_fallback() {
    require_gpu!();
    let h = handler();
    let m = h.create_from_host(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let v = h.create_from_host(&[2.0, 2.0, 2.0, 2.0], &[2, 2]).unwrap();
    let out = h.zeros(&[2, 2]).unwrap();
    h.mult_mv(&m, &v, &out).unwrap();
    assert_eq!(h.get_host_copy(&out).unwrap(), vec![2.0, 4.0, 6.0, 8.0]);
}

// ============================================================================
// Activations
// ============================================================================

#[test]
fn test_sigmoid_and_deriv() {
    require_gpu!();
    let h = handler();
    let x = h.create_from_host(&[0.0, 0.0, 0.0], &[3]).unwrap();
    let y = h.zeros(&[3]).unwrap();
    h.sigmoid(&x, &y).unwrap();
    assert_close(&h.get_host_copy(&y).unwrap(), &[0.5, 0.5, 0.5], 1e-6);

    // f'(0) = 0.25 when dy = 1.
    let dy = h.ones(&[3]).unwrap();
    let dx = h.zeros(&[3]).unwrap();
    h.sigmoid_deriv(&x, &y, &dy, &dx).unwrap();
    assert_close(&h.get_host_copy(&dx).unwrap(), &[0.25, 0.25, 0.25], 1e-6);
}

#[test]
fn test_tanh_and_deriv() {
    require_gpu!();
    let h = handler();
    let x = h.create_from_host(&[0.0, 1.0, -1.0], &[3]).unwrap();
    let y = h.zeros(&[3]).unwrap();
    h.tanh(&x, &y).unwrap();
    assert_close(
        &h.get_host_copy(&y).unwrap(),
        &[0.0, 1.0f32.tanh(), -(1.0f32.tanh())],
        1e-5,
    );

    let dy = h.ones(&[3]).unwrap();
    let dx = h.zeros(&[3]).unwrap();
    h.tanh_deriv(&x, &y, &dy, &dx).unwrap();
    let t = 1.0f32.tanh();
    assert_close(&h.get_host_copy(&dx).unwrap(), &[1.0, 1.0 - t * t, 1.0 - t * t], 1e-5);
}

#[test]
fn test_relu_and_deriv() {
    require_gpu!();
    let h = handler();
    let x = h.create_from_host(&[-2.0, -1.0, 0.0, 1.0, 2.0], &[5]).unwrap();
    let y = h.zeros(&[5]).unwrap();
    h.rel(&x, &y).unwrap();
    assert_eq!(h.get_host_copy(&y).unwrap(), vec![0.0, 0.0, 0.0, 1.0, 2.0]);

    let dy = h.ones(&[5]).unwrap();
    let dx = h.zeros(&[5]).unwrap();
    h.rel_deriv(&x, &y, &dy, &dx).unwrap();
    assert_eq!(h.get_host_copy(&dx).unwrap(), vec![0.0, 0.0, 0.0, 1.0, 1.0]);
}

// ============================================================================
// Softmax
// ============================================================================

#[test]
fn test_softmax_rows_sum_to_one() {
    require_gpu!();
    let h = handler();
    let m = h
        .create_from_host(&[1.0, 2.0, 3.0, -1.0, 0.0, 1.0], &[2, 3])
        .unwrap();
    let out = h.zeros(&[2, 3]).unwrap();
    let result = h.softmax_m(&m, &out).unwrap();
    let host = h.get_host_copy(result).unwrap();

    for row in host.chunks(3) {
        let total: f32 = row.iter().sum();
        assert!((total - 1.0).abs() < 1e-5, "row sums to {}", total);
        assert!(row.iter().all(|&p| p > 0.0));
    }
    // Larger logits get larger probabilities within a row.
    assert!(host[0] < host[1] && host[1] < host[2]);
}

#[test]
fn test_softmax_shift_invariance() {
    require_gpu!();
    let h = handler();
    // Naive exp() overflows on logits near 1000; the row-max subtraction
    // must make these two rows identical.
    let m = h
        .create_from_host(&[0.0, 1.0, 2.0, 1000.0, 1001.0, 1002.0], &[2, 3])
        .unwrap();
    let out = h.zeros(&[2, 3]).unwrap();
    h.softmax_m(&m, &out).unwrap();
    let host = h.get_host_copy(&out).unwrap();
    assert!(host.iter().all(|p| p.is_finite()));
    assert_close(&host[0..3], &host[3..6], 1e-5);
}

#[test]
fn test_softmax_wide_row() {
    require_gpu!();
    let h = handler();
    // Wider than one 32-thread block so the stride loop is exercised.
    let cols = 100;
    let data: Vec<f32> = (0..cols).map(|i| (i % 7) as f32 * 0.1).collect();
    let m = h.create_from_host(&data, &[1, cols]).unwrap();
    let out = h.zeros(&[1, cols]).unwrap();
    h.softmax_m(&m, &out).unwrap();
    let total: f32 = h.get_host_copy(&out).unwrap().iter().sum();
    assert!((total - 1.0).abs() < 1e-4, "row sums to {}", total);
}

// ============================================================================
// BLAS
// ============================================================================

#[test]
fn test_dot_mm() {
    require_gpu!();
    let h = handler();
    let a = h.create_from_host(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let b = h.create_from_host(&[5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
    let out = h.zeros(&[2, 2]).unwrap();
    h.dot_mm(&a, &b, &out, false, false).unwrap();
    assert_close(&h.get_host_copy(&out).unwrap(), &[19.0, 22.0, 43.0, 50.0], 1e-5);
}

#[test]
fn test_dot_mm_transposes() {
    require_gpu!();
    let h = handler();
    // a is (3, 2), a^T is (2, 3); b is (3, 2).
    let a = h
        .create_from_host(&[1.0, 4.0, 2.0, 5.0, 3.0, 6.0], &[3, 2])
        .unwrap();
    let b = h
        .create_from_host(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2])
        .unwrap();
    let out = h.zeros(&[2, 2]).unwrap();
    h.dot_mm(&a, &b, &out, true, false).unwrap();
    // [[1,2,3],[4,5,6]] · [[7,8],[9,10],[11,12]]
    assert_close(&h.get_host_copy(&out).unwrap(), &[58.0, 64.0, 139.0, 154.0], 1e-4);

    let bt = h
        .create_from_host(&[7.0, 9.0, 11.0, 8.0, 10.0, 12.0], &[2, 3])
        .unwrap();
    h.dot_mm(&a, &bt, &out, true, true).unwrap();
    assert_close(&h.get_host_copy(&out).unwrap(), &[58.0, 64.0, 139.0, 154.0], 1e-4);
}

#[test]
fn test_dot_add_mm_accumulates() {
    require_gpu!();
    let h = handler();
    let a = h.create_from_host(&[1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
    let b = h.create_from_host(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let out = h.create_from_host(&[10.0, 10.0, 10.0, 10.0], &[2, 2]).unwrap();
    h.dot_add_mm(&a, &b, &out, false, false).unwrap();
    assert_close(&h.get_host_copy(&out).unwrap(), &[11.0, 12.0, 13.0, 14.0], 1e-5);
}

#[test]
fn test_sum_total_and_axes() {
    require_gpu!();
    let h = handler();
    let a = h
        .create_from_host(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
        .unwrap();

    let total = h.zeros(&[1]).unwrap();
    h.sum_t(&a, None, &total).unwrap();
    assert_close(&h.get_host_copy(&total).unwrap(), &[21.0], 1e-5);

    let col_sums = h.zeros(&[3]).unwrap();
    h.sum_t(&a, Some(0), &col_sums).unwrap();
    assert_close(&h.get_host_copy(&col_sums).unwrap(), &[5.0, 7.0, 9.0], 1e-5);

    let row_sums = h.zeros(&[2]).unwrap();
    h.sum_t(&a, Some(1), &row_sums).unwrap();
    assert_close(&h.get_host_copy(&row_sums).unwrap(), &[6.0, 15.0], 1e-5);
}

#[test]
fn test_sum_vector_axis_zero() {
    require_gpu!();
    let h = handler();
    let v = h.create_from_host(&[1.5, 2.5, 3.0], &[3]).unwrap();
    let out = h.zeros(&[1]).unwrap();
    h.sum_t(&v, Some(0), &out).unwrap();
    assert_close(&h.get_host_copy(&out).unwrap(), &[7.0], 1e-5);
}

#[test]
fn test_sum_rejects_higher_rank_axis() {
    require_gpu!();
    let h = handler();
    let a = h.zeros(&[2, 2, 2]).unwrap();
    let out = h.zeros(&[2]).unwrap();
    let err = h.sum_t(&a, Some(1), &out).unwrap_err();
    assert!(matches!(err, BackendError::Unsupported(_)), "{}", err);
}

// ============================================================================
// Convolution (needs cuDNN on top of the device)
// ============================================================================

fn cudnn_handler() -> Option<Handler> {
    if !is_cuda_available() {
        eprintln!("skipping: no CUDA device");
        return None;
    }
    match Handler::with_options(HandlerOptions {
        init_cudnn: true,
        ..HandlerOptions::default()
    }) {
        Ok(h) => Some(h),
        Err(e) => {
            eprintln!("skipping: cuDNN not loadable ({})", e);
            None
        }
    }
}

#[test]
fn test_conv_unavailable_without_cudnn() {
    require_gpu!();
    let h = handler();
    let x = h.zeros(&[1, 1, 3, 3]).unwrap();
    let w = h.zeros(&[1, 1, 2, 2]).unwrap();
    let bias = h.zeros(&[1]).unwrap();
    let y = h.zeros(&[1, 1, 2, 2]).unwrap();
    let err = h
        .conv2d_forward_batch(&x, &w, &bias, &y, 0, (1, 1))
        .unwrap_err();
    assert!(matches!(err, BackendError::CudnnUnavailable(_)), "{}", err);
}

#[test]
fn test_conv_forward_identity_kernel() {
    let Some(h) = cudnn_handler() else { return };
    // 1x1 filter of weight 1 with bias 0 is the identity.
    let data: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let x = h.create_from_host(&data, &[1, 1, 3, 3]).unwrap();
    let w = h.create_from_host(&[1.0], &[1, 1, 1, 1]).unwrap();
    let bias = h.zeros(&[1]).unwrap();
    let y = h.zeros(&[1, 1, 3, 3]).unwrap();
    h.conv2d_forward_batch(&x, &w, &bias, &y, 0, (1, 1)).unwrap();
    assert_close(&h.get_host_copy(&y).unwrap(), &data, 1e-5);
}

#[test]
fn test_conv_forward_sum_kernel_with_bias() {
    let Some(h) = cudnn_handler() else { return };
    // 2x2 all-ones filter sums each window; bias shifts every output.
    let x = h
        .create_from_host(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], &[1, 1, 3, 3])
        .unwrap();
    let w = h.create_from_host(&[1.0; 4], &[1, 1, 2, 2]).unwrap();
    let bias = h.create_from_host(&[0.5], &[1]).unwrap();
    let y = h.zeros(&[1, 1, 2, 2]).unwrap();
    h.conv2d_forward_batch(&x, &w, &bias, &y, 0, (1, 1)).unwrap();
    assert_close(&h.get_host_copy(&y).unwrap(), &[12.5, 16.5, 24.5, 28.5], 1e-5);
}

#[test]
fn test_conv_backward_bias_gradient() {
    let Some(h) = cudnn_handler() else { return };
    let x = h.zeros(&[1, 1, 2, 2]).unwrap();
    let dx = h.zeros(&[1, 1, 2, 2]).unwrap();
    let w = h.create_from_host(&[1.0], &[1, 1, 1, 1]).unwrap();
    let dw = h.zeros(&[1, 1, 1, 1]).unwrap();
    let bias = h.zeros(&[1]).unwrap();
    let db = h.zeros(&[1]).unwrap();
    let dy = h
        .create_from_host(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2])
        .unwrap();
    h.conv2d_backward_batch(&dy, &x, &dx, &w, &bias, &dw, &db, 0, (1, 1))
        .unwrap();
    // Bias gradient is the sum of the upstream deltas.
    assert_close(&h.get_host_copy(&db).unwrap(), &[10.0], 1e-5);
}

#[test]
fn test_conv_backward_accumulates_and_propagates() {
    let Some(h) = cudnn_handler() else { return };
    // Identity 1x1 filter: dx mirrors dy, dw is sum(x * dy).
    let x = h
        .create_from_host(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2])
        .unwrap();
    let dx = h.zeros(&[1, 1, 2, 2]).unwrap();
    let w = h.create_from_host(&[2.0], &[1, 1, 1, 1]).unwrap();
    let dw = h.zeros(&[1, 1, 1, 1]).unwrap();
    let bias = h.zeros(&[1]).unwrap();
    let db = h.zeros(&[1]).unwrap();
    let dy = h.create_from_host(&[1.0; 4], &[1, 1, 2, 2]).unwrap();

    h.conv2d_backward_batch(&dy, &x, &dx, &w, &bias, &dw, &db, 0, (1, 1))
        .unwrap();
    assert_close(&h.get_host_copy(&dx).unwrap(), &[2.0, 2.0, 2.0, 2.0], 1e-5);
    assert_close(&h.get_host_copy(&dw).unwrap(), &[10.0], 1e-5);

    // Gradients accumulate across calls.
    h.conv2d_backward_batch(&dy, &x, &dx, &w, &bias, &dw, &db, 0, (1, 1))
        .unwrap();
    assert_close(&h.get_host_copy(&dw).unwrap(), &[20.0], 1e-5);
    assert_close(&h.get_host_copy(&db).unwrap(), &[8.0], 1e-5);
}
