//! ndarray <-> burn tensor conversion helpers.

use burn::prelude::*;
use ndarray::{Array1, Array4};

/// Upload a `[batch, channel, h, w]` array to the device.
pub fn array4_to_tensor<B: Backend>(array: &Array4<f32>, device: &B::Device) -> Tensor<B, 4> {
    let (a, b, c, d) = array.dim();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(data, [a, b, c, d]), device)
}

/// Read a rank-4 tensor back into an ndarray.
pub fn tensor_to_array4<B: Backend>(tensor: Tensor<B, 4>) -> Array4<f32> {
    let [a, b, c, d] = tensor.dims();
    let data: Vec<f32> = tensor
        .into_data()
        .to_vec::<f32>()
        .expect("tensor readback");
    Array4::from_shape_vec((a, b, c, d), data).expect("tensor readback shape")
}

/// Upload a 1D array to the device.
pub fn array1_to_tensor<B: Backend>(array: &Array1<f32>, device: &B::Device) -> Tensor<B, 1> {
    Tensor::from_data(TensorData::new(array.to_vec(), [array.len()]), device)
}

/// Upload per-channel parameters as a broadcastable `[1, C, 1, 1]` tensor.
pub fn array1_to_channel_tensor<B: Backend>(
    array: &Array1<f32>,
    device: &B::Device,
) -> Tensor<B, 4> {
    let n = array.len();
    array1_to_tensor(array, device).reshape([1, n, 1, 1])
}

/// Read a `[1, C, 1, 1]` channel tensor back into a 1D array.
pub fn channel_tensor_to_array1<B: Backend>(tensor: Tensor<B, 4>) -> Array1<f32> {
    let data: Vec<f32> = tensor
        .into_data()
        .to_vec::<f32>()
        .expect("tensor readback");
    Array1::from_vec(data)
}
