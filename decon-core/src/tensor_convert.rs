use crate::common::*;
use candle_core::{Device, Tensor};

/// Copy a (column-major) `nalgebra` matrix into a row-major 2D tensor.
pub fn mat_to_tensor(mat: &Mat, device: &Device) -> candle_core::Result<Tensor> {
    let (nrows, ncols) = mat.shape();
    let mut data = Vec::with_capacity(nrows * ncols);
    for i in 0..nrows {
        for j in 0..ncols {
            data.push(mat[(i, j)]);
        }
    }
    Tensor::from_vec(data, (nrows, ncols), device)
}

/// Read a 2D tensor back into a dense `nalgebra` matrix.
pub fn tensor_to_mat(tensor: &Tensor) -> candle_core::Result<Mat> {
    let (nrows, ncols) = tensor.dims2()?;
    let rows: Vec<Vec<f32>> = tensor.to_vec2()?;
    Ok(Mat::from_row_iterator(
        nrows,
        ncols,
        rows.into_iter().flatten(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_layout() {
        let mat = Mat::from_row_iterator(2, 3, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let tensor = mat_to_tensor(&mat, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims2().unwrap(), (2, 3));
        let back = tensor_to_mat(&tensor).unwrap();
        assert_eq!(back, mat);
    }
}
