use crate::tensor::Tensor;
use crate::utils::ceil_divide;
use crate::{assert_eq_result, assert_result, Result};

/// Dimensions of one multi-head self-attention call over a single sequence.
///
/// `r` query rows, `c` key/value columns, `h` heads of width `d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttentionParameters {
    pub r: usize,
    pub c: usize,
    pub h: usize,
    pub d: usize,
}

impl AttentionParameters {
    fn hidden(&self) -> usize {
        self.h * self.d
    }

    fn scale(&self) -> f64 {
        1.0 / (self.d as f64).sqrt()
    }
}

fn head_dims(hidden: usize, heads: usize) -> Result<usize> {
    assert_result!(heads > 0, "head count must be greater than 0");
    assert_result!(
        hidden % heads == 0,
        "hidden size {} is not divisible by {} heads",
        hidden,
        heads
    );
    Ok(hidden / heads)
}

/// Scaled dot-product attention over separate `q: [r, h*d]`, `k, v: [c, h*d]`.
///
/// Materializes the full `[h, r, c]` probability matrix. Scores, probabilities
/// and the weighted sum are kept in f64 and rounded to f32 once at the end.
pub fn encode_attention(
    q: &Tensor<f32>,
    k: &Tensor<f32>,
    v: &Tensor<f32>,
    heads: usize,
) -> Result<Tensor<f32>> {
    let (r, q_hidden) = q.shape().dims2()?;
    let (c, k_hidden) = k.shape().dims2()?;
    let (v_c, v_hidden) = v.shape().dims2()?;

    assert_eq_result!(c, v_c, "C does not match");
    assert_eq_result!(q_hidden, k_hidden, "H does not match");
    assert_eq_result!(q_hidden, v_hidden, "H does not match");
    assert_result!(c > 0, "C must be greater than 0");
    let d = head_dims(q_hidden, heads)?;

    let p = AttentionParameters { r, c, h: heads, d };
    let out = standard(q.data(), k.data(), v.data(), p);
    Tensor::from_vec(out, [r, q_hidden])
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

fn standard(q: &[f32], k: &[f32], v: &[f32], p: AttentionParameters) -> Vec<f32> {
    let hidden = p.hidden();
    let scale = p.scale();

    let mut probs = vec![0.0f64; p.h * p.r * p.c];
    for head in 0..p.h {
        let off = head * p.d;
        for i in 0..p.r {
            let row = &mut probs[(head * p.r + i) * p.c..(head * p.r + i + 1) * p.c];
            let q_row = &q[i * hidden + off..i * hidden + off + p.d];
            for (j, score) in row.iter_mut().enumerate() {
                let k_row = &k[j * hidden + off..j * hidden + off + p.d];
                *score = dot(q_row, k_row) * scale;
            }
            softmax_in_place(row);
        }
    }

    let mut out = vec![0.0f64; p.r * hidden];
    for head in 0..p.h {
        let off = head * p.d;
        for i in 0..p.r {
            let row = &probs[(head * p.r + i) * p.c..(head * p.r + i + 1) * p.c];
            let o = &mut out[i * hidden + off..i * hidden + off + p.d];
            for (j, &w) in row.iter().enumerate() {
                let v_row = &v[j * hidden + off..j * hidden + off + p.d];
                for (acc, x) in o.iter_mut().zip(v_row) {
                    *acc += w * *x as f64;
                }
            }
        }
    }
    out.into_iter().map(|x| x as f32).collect()
}

fn softmax_in_place(row: &mut [f64]) {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in row.iter_mut() {
        *x /= sum;
    }
}

/// Self-attention over a packed projection `qkv: [s, 3*h*d]` laid out as
/// `[q | k | v]` per row.
///
/// Keys and values are visited in blocks of `block_size` columns with a running
/// max and running sum per query row, so no score row longer than one block
/// is ever held.
pub fn encode_flash_attention(
    qkv: &Tensor<f32>,
    heads: usize,
    block_size: usize,
) -> Result<Tensor<f32>> {
    let (s, packed) = qkv.shape().dims2()?;
    assert_result!(block_size > 0, "block_size must be greater than 0");
    assert_result!(s > 0, "sequence must not be empty");
    assert_eq_result!(
        packed % 3,
        0,
        "packed projection width {} is not a multiple of 3",
        packed
    );
    let hidden = packed / 3;
    let d = head_dims(hidden, heads)?;

    let p = AttentionParameters {
        r: s,
        c: s,
        h: heads,
        d,
    };
    let out = flash(qkv.data(), p, block_size);
    Tensor::from_vec(out, [s, hidden])
}

fn flash(qkv: &[f32], p: AttentionParameters, block_size: usize) -> Vec<f32> {
    let hidden = p.hidden();
    let stride = 3 * hidden;
    let scale = p.scale();
    let num_blocks = ceil_divide(p.c, block_size);

    let mut out = vec![0.0f64; p.r * hidden];
    let mut scores = vec![0.0f64; block_size];
    let mut row_max = vec![f64::NEG_INFINITY; p.r];
    let mut row_sum = vec![0.0f64; p.r];

    for head in 0..p.h {
        let q_off = head * p.d;
        let k_off = hidden + head * p.d;
        let v_off = 2 * hidden + head * p.d;
        row_max.fill(f64::NEG_INFINITY);
        row_sum.fill(0.0);

        for block in 0..num_blocks {
            let start = block * block_size;
            let end = (start + block_size).min(p.c);
            let len = end - start;

            for i in 0..p.r {
                let q_row = &qkv[i * stride + q_off..i * stride + q_off + p.d];
                for (slot, j) in scores[..len].iter_mut().zip(start..end) {
                    let k_row = &qkv[j * stride + k_off..j * stride + k_off + p.d];
                    *slot = dot(q_row, k_row) * scale;
                }

                let block_max = scores[..len].iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let old_max = row_max[i];
                let new_max = old_max.max(block_max);
                row_max[i] = new_max;

                let mut block_sum = 0.0;
                for x in scores[..len].iter_mut() {
                    *x = (*x - new_max).exp();
                    block_sum += *x;
                }

                let rescale = (old_max - new_max).exp();
                let o = &mut out[i * hidden + q_off..i * hidden + q_off + p.d];
                for acc in o.iter_mut() {
                    *acc *= rescale;
                }
                row_sum[i] = row_sum[i] * rescale + block_sum;

                for (&w, j) in scores[..len].iter().zip(start..end) {
                    let v_row = &qkv[j * stride + v_off..j * stride + v_off + p.d];
                    for (acc, x) in o.iter_mut().zip(v_row) {
                        *acc += w * *x as f64;
                    }
                }
            }
        }

        for i in 0..p.r {
            let o = &mut out[i * hidden + q_off..i * hidden + q_off + p.d];
            for acc in o.iter_mut() {
                *acc /= row_sum[i];
            }
        }
    }
    out.into_iter().map(|x| x as f32).collect()
}
