use burn::tensor::{backend::Backend, Element, ElementConversion, Numeric, Tensor};

pub fn pad<const D: usize, K, E, B>(
    tensor: Tensor<B, D, K>,
    pad_width: [(usize, usize); D],
    fill_value: E,
) -> Tensor<B, D, K>
where
    B: Backend,
    K: Numeric<B>,
    K::Elem: Element,
    E: ElementConversion,
{
    let device = tensor.device();
    let origin_shape = tensor.dims();

    let pad_shape: [usize; D] =
        core::array::from_fn(|idx| origin_shape[idx] + pad_width[idx].0 + pad_width[idx].1);
    let assign_range = core::array::from_fn(|idx| {
        let (left_pad, _) = pad_width[idx];
        left_pad..(left_pad + origin_shape[idx])
    });

    let padded = Tensor::<B, D, K>::full(pad_shape, fill_value, &device);

    padded.slice_assign::<D>(assign_range, tensor)
}

/// Moves every row `shift` columns to the right, filling the vacated columns.
/// `out[:, s] = tensor[:, s - shift]`.
pub fn shift_right<B: Backend>(tensor: Tensor<B, 2>, shift: usize, fill_value: f32) -> Tensor<B, 2> {
    let [rows, cols] = tensor.dims();
    if shift >= cols {
        return Tensor::full([rows, cols], fill_value, &tensor.device());
    }

    pad(
        tensor.slice([0..rows, 0..(cols - shift)]),
        [(0, 0), (shift, 0)],
        fill_value,
    )
}

/// `out[:, s] = tensor[:, s + shift]`.
pub fn shift_left<B: Backend>(tensor: Tensor<B, 2>, shift: usize, fill_value: f32) -> Tensor<B, 2> {
    let [rows, cols] = tensor.dims();
    if shift >= cols {
        return Tensor::full([rows, cols], fill_value, &tensor.device());
    }

    pad(
        tensor.slice([0..rows, shift..cols]),
        [(0, 0), (0, shift)],
        fill_value,
    )
}

/// Element-wise `log(exp(a) + exp(b) + exp(c))`.
///
/// Inputs must be finite: the largest term contributes `exp(0)`, so the sum
/// never drops below one and no epsilon is needed inside the log.
pub fn log_sum_exp3<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>, c: Tensor<B, 2>) -> Tensor<B, 2> {
    let [rows, cols] = a.dims();
    let max = Tensor::cat(
        vec![
            a.clone().reshape([rows, cols, 1]),
            b.clone().reshape([rows, cols, 1]),
            c.clone().reshape([rows, cols, 1]),
        ],
        2,
    )
    .max_dim(2)
    .reshape([rows, cols]);

    let sum = (a - max.clone()).exp() + (b - max.clone()).exp() + (c - max.clone()).exp();

    sum.log() + max
}

/// `log(sum(exp(tensor)))` along the columns, `[rows, cols] -> [rows]`.
pub fn log_sum_exp_rows<B: Backend>(tensor: Tensor<B, 2>) -> Tensor<B, 1> {
    let [rows, cols] = tensor.dims();
    let max = tensor.clone().max_dim(1);
    let sum = (tensor - max.clone().repeat(1, cols)).exp().sum_dim(1);

    (sum.log() + max).reshape([rows])
}
