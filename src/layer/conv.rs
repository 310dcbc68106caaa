use crate::{
  internal::*,
  tensor::{ Tensor, lops::Window },
  layer::{ Layer, Param, Args, Trace, named, parameterized, replay, take_param },
  error::{ Error, Result },
};


fn check_groups(groups: usize, in_channels: usize, out_channels: usize) -> Result<()> {
  if groups == 0 || in_channels % groups != 0 || out_channels % groups != 0 {
    return Err(Error::InvalidArgument(format!(
      "{groups} groups don't divide {in_channels} input and {out_channels} output channels")))
  }
  Ok(())
}


/// Grouped 2-D convolution without bias.
///
/// Every input row holds one image, flattened channel-major as
/// `in_channels × height × width`. Output rows are flattened the
/// same way as `out_channels × out_height × out_width`.

#[derive(Debug, Clone)]
pub struct Conv2D {
  name: String,
  in_channels: usize,
  out_channels: usize,
  height: usize,
  width: usize,
  kernel: [usize; 2],
  stride: [usize; 2],
  padding: [usize; 2],
  dilation: usize,
  groups: usize,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl Conv2D {
  pub fn new(in_channels: usize, out_channels: usize, kernel: [usize; 2], height: usize, width: usize) -> Self {
    let mut layer = Self {
      name: "conv2d".to_string(),
      in_channels,
      out_channels,
      height,
      width,
      kernel,
      stride: [1, 1],
      padding: [0, 0],
      dilation: 1,
      groups: 1,
      params: Vec::new(),
      frozen: false,
      trace: None,
    };
    layer.reset();
    layer
  }

  pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
    self.stride = stride;
    self
  }

  pub fn with_padding(mut self, padding: [usize; 2]) -> Self {
    self.padding = padding;
    self
  }

  pub fn with_dilation(mut self, dilation: usize) -> Self {
    self.dilation = dilation;
    self
  }

  pub fn with_groups(mut self, groups: usize) -> Self {
    self.groups = groups;
    self.reset();
    self
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let mut layer = Self {
      name: name.to_string(),
      in_channels: arg(args, "inC")?,
      out_channels: arg(args, "outC")?,
      height: arg(args, "height")?,
      width: arg(args, "width")?,
      kernel: [arg(args, "kernel1")?, arg(args, "kernel2")?],
      stride: [arg(args, "stride1")?, arg(args, "stride2")?],
      padding: [arg(args, "padding1")?, arg(args, "padding2")?],
      dilation: arg(args, "dilation")?,
      groups: arg(args, "groups")?,
      params: Vec::new(),
      frozen: false,
      trace: None,
    };
    layer.params = vec![take_param(&mut params, "w", Some(layer.kernel_dims()))?];
    Ok(layer)
  }

  pub fn window(&self) -> Window {
    Window {
      channels: self.in_channels,
      height: self.height,
      width: self.width,
      kernel: self.kernel,
      stride: self.stride,
      padding: self.padding,
      dilation: self.dilation,
    }
  }

  fn kernel_dims(&self) -> Dims {
    let fan_in = self.in_channels / self.groups.max(1) * self.kernel[0] * self.kernel[1];
    (self.out_channels, fan_in)
  }
}

impl Layer for Conv2D {
  named!("conv2d");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    check_groups(self.groups, self.in_channels, self.out_channels)?;
    let (window, groups) = (self.window(), self.groups);
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, params| {
      graph.conv2d(x, params[0], window, groups)
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "conv2d", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    [
      ("inC", self.in_channels),
      ("outC", self.out_channels),
      ("height", self.height),
      ("width", self.width),
      ("kernel1", self.kernel[0]),
      ("kernel2", self.kernel[1]),
      ("stride1", self.stride[0]),
      ("stride2", self.stride[1]),
      ("padding1", self.padding[0]),
      ("padding2", self.padding[1]),
      ("dilation", self.dilation),
      ("groups", self.groups),
    ].into_iter().map(|(key, value)| (key.to_string(), value as f32) ).collect()
  }

  fn reset(&mut self) {
    let (rows, cols) = self.kernel_dims();
    self.params = vec![Param::new("w", Tensor::glorot_uniform(rows, cols))];
  }
}


/// Grouped 2-D transposed convolution without bias, the
/// gradient of [Conv2D] with respect to its input.
///
/// Input rows hold `in_channels × height × width` images. Each output
/// side grows to `(size - 1)·stride - 2·padding + dilation·(kernel - 1)
/// + output_padding + 1`, flattened as `out_channels × out_height × out_width`.

#[derive(Debug, Clone)]
pub struct ConvTranspose2D {
  name: String,
  in_channels: usize,
  out_channels: usize,
  height: usize,
  width: usize,
  kernel: [usize; 2],
  stride: [usize; 2],
  padding: [usize; 2],
  output_padding: [usize; 2],
  dilation: usize,
  groups: usize,
  params: Vec<Param>,
  frozen: bool,
  trace: Option<Trace>,
}

impl ConvTranspose2D {
  pub fn new(in_channels: usize, out_channels: usize, kernel: [usize; 2], height: usize, width: usize) -> Self {
    let mut layer = Self {
      name: "conv_transpose2d".to_string(),
      in_channels,
      out_channels,
      height,
      width,
      kernel,
      stride: [1, 1],
      padding: [0, 0],
      output_padding: [0, 0],
      dilation: 1,
      groups: 1,
      params: Vec::new(),
      frozen: false,
      trace: None,
    };
    layer.reset();
    layer
  }

  pub fn with_stride(mut self, stride: [usize; 2]) -> Self {
    self.stride = stride;
    self
  }

  pub fn with_padding(mut self, padding: [usize; 2]) -> Self {
    self.padding = padding;
    self
  }

  /// Extra rows and columns added to the bottom and right of the
  /// output, to pick one of the sizes a strided convolution maps
  /// onto the same input size. Has to stay below the stride.

  pub fn with_output_padding(mut self, output_padding: [usize; 2]) -> Self {
    self.output_padding = output_padding;
    self
  }

  pub fn with_dilation(mut self, dilation: usize) -> Self {
    self.dilation = dilation;
    self
  }

  pub fn with_groups(mut self, groups: usize) -> Self {
    self.groups = groups;
    self.reset();
    self
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let mut layer = Self {
      name: name.to_string(),
      in_channels: arg(args, "inC")?,
      out_channels: arg(args, "outC")?,
      height: arg(args, "height")?,
      width: arg(args, "width")?,
      kernel: [arg(args, "kernel1")?, arg(args, "kernel2")?],
      stride: [arg(args, "stride1")?, arg(args, "stride2")?],
      padding: [arg(args, "padding1")?, arg(args, "padding2")?],
      output_padding: [arg_or(args, "output_padding1", 0.0) as usize, arg_or(args, "output_padding2", 0.0) as usize],
      dilation: arg(args, "dilation")?,
      groups: arg(args, "groups")?,
      params: Vec::new(),
      frozen: false,
      trace: None,
    };
    layer.params = vec![take_param(&mut params, "w", Some(layer.kernel_dims()))?];
    Ok(layer)
  }

  /// Height and width of the output images, `None` if
  /// the padding swallows them completely.

  pub fn output_dims(&self) -> Option<Dims> {
    let extent = |size: usize, i: usize| {
      let grown = size.checked_sub(1)? * self.stride[i] + self.dilation * (self.kernel[i].max(1) - 1) + self.output_padding[i] + 1;
      grown.checked_sub(2 * self.padding[i]).filter(|&side| side > 0 )
    };
    Some((extent(self.height, 0)?, extent(self.width, 1)?))
  }

  /// Geometry of the output images, as seen by the matching convolution.

  pub fn window(&self) -> Result<Window> {
    let (height, width) = self.output_dims()
      .ok_or_else(|| Error::shape("conv_transpose2d", (self.height, self.width), (self.kernel[0], self.kernel[1])) )?;
    Ok(Window {
      channels: self.out_channels,
      height,
      width,
      kernel: self.kernel,
      stride: self.stride,
      padding: self.padding,
      dilation: self.dilation,
    })
  }

  fn kernel_dims(&self) -> Dims {
    let fan_out = self.out_channels / self.groups.max(1) * self.kernel[0] * self.kernel[1];
    (self.in_channels, fan_out)
  }

  fn check(&self) -> Result<()> {
    check_groups(self.groups, self.in_channels, self.out_channels)?;
    if self.kernel.contains(&0) || self.stride.contains(&0) || self.dilation == 0 {
      return Err(Error::InvalidArgument(format!(
        "conv_transpose2d kernel {:?}, stride {:?} and dilation {} must be positive",
        self.kernel, self.stride, self.dilation)))
    }
    if self.output_padding.iter().zip(&self.stride).any(|(pad, stride)| pad >= stride ) {
      return Err(Error::InvalidArgument(format!(
        "output padding {:?} has to be smaller than stride {:?}", self.output_padding, self.stride)))
    }
    Ok(())
  }
}

impl Layer for ConvTranspose2D {
  named!("conv_transpose2d");
  parameterized!();

  fn forward(&mut self, x: &Tensor, _training: bool) -> Result<Tensor> {
    self.check()?;
    let (window, groups) = (self.window()?, self.groups);
    let trace = Trace::record(x, &self.params, self.frozen, |graph, x, params| {
      graph.conv_transpose2d(x, params[0], window, groups)
    })?;
    let output = trace.output();
    self.trace = Some(trace);
    Ok(output)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    replay(&mut self.trace, "conv_transpose2d", grad, &mut self.params)
  }

  fn args(&self) -> Args {
    [
      ("inC", self.in_channels),
      ("outC", self.out_channels),
      ("height", self.height),
      ("width", self.width),
      ("kernel1", self.kernel[0]),
      ("kernel2", self.kernel[1]),
      ("stride1", self.stride[0]),
      ("stride2", self.stride[1]),
      ("padding1", self.padding[0]),
      ("padding2", self.padding[1]),
      ("output_padding1", self.output_padding[0]),
      ("output_padding2", self.output_padding[1]),
      ("dilation", self.dilation),
      ("groups", self.groups),
    ].into_iter().map(|(key, value)| (key.to_string(), value as f32) ).collect()
  }

  fn reset(&mut self) {
    let (rows, cols) = self.kernel_dims();
    self.params = vec![Param::new("w", Tensor::glorot_uniform(rows, cols))];
  }
}


/// Transposed convolution along a single axis, over rows
/// holding `in_channels × length` sequences.

#[derive(Debug, Clone)]
pub struct ConvTranspose1D {
  inner: ConvTranspose2D,
}

impl ConvTranspose1D {
  pub fn new(in_channels: usize, out_channels: usize, kernel: usize, length: usize) -> Self {
    let mut inner = ConvTranspose2D::new(in_channels, out_channels, [1, kernel], 1, length);
    inner.name = "conv_transpose1d".to_string();
    Self { inner }
  }

  pub fn with_stride(mut self, stride: usize) -> Self {
    self.inner.stride = [1, stride];
    self
  }

  pub fn with_padding(mut self, padding: usize) -> Self {
    self.inner.padding = [0, padding];
    self
  }

  pub fn with_output_padding(mut self, output_padding: usize) -> Self {
    self.inner.output_padding = [0, output_padding];
    self
  }

  pub fn with_dilation(mut self, dilation: usize) -> Self {
    self.inner.dilation = dilation;
    self
  }

  pub fn with_groups(mut self, groups: usize) -> Self {
    self.inner = self.inner.with_groups(groups);
    self
  }

  pub fn from_parts(name: &str, mut params: Vec<Param>, args: &Args) -> Result<Self> {
    let mut layer = Self::new(arg(args, "inC")?, arg(args, "outC")?, arg(args, "kernel")?, arg(args, "length")?)
      .with_stride(arg(args, "stride")?)
      .with_padding(arg(args, "padding")?)
      .with_output_padding(arg_or(args, "output_padding", 0.0) as usize)
      .with_dilation(arg(args, "dilation")?);
    layer.inner.groups = arg(args, "groups")?;
    layer.inner.name = name.to_string();
    layer.inner.params = vec![take_param(&mut params, "w", Some(layer.inner.kernel_dims()))?];
    Ok(layer)
  }

  /// Length of the output sequences.

  pub fn output_len(&self) -> Option<usize> {
    self.inner.output_dims().map(|(_, len)| len )
  }
}

impl Layer for ConvTranspose1D {
  fn class(&self) -> &'static str {
    "conv_transpose1d"
  }

  fn name(&self) -> &str {
    self.inner.name()
  }

  fn rename(&mut self, name: &str) {
    self.inner.rename(name);
  }

  fn forward(&mut self, x: &Tensor, training: bool) -> Result<Tensor> {
    self.inner.forward(x, training)
  }

  fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
    self.inner.backward(grad)
  }

  fn params(&self) -> Vec<&Param> {
    self.inner.params()
  }

  fn params_mut(&mut self) -> Vec<&mut Param> {
    self.inner.params_mut()
  }

  fn args(&self) -> Args {
    let inner = &self.inner;
    [
      ("inC", inner.in_channels),
      ("outC", inner.out_channels),
      ("length", inner.width),
      ("kernel", inner.kernel[1]),
      ("stride", inner.stride[1]),
      ("padding", inner.padding[1]),
      ("output_padding", inner.output_padding[1]),
      ("dilation", inner.dilation),
      ("groups", inner.groups),
    ].into_iter().map(|(key, value)| (key.to_string(), value as f32) ).collect()
  }

  fn freeze(&mut self) {
    self.inner.freeze();
  }

  fn unfreeze(&mut self) {
    self.inner.unfreeze();
  }

  fn is_frozen(&self) -> bool {
    self.inner.is_frozen()
  }

  fn reset(&mut self) {
    self.inner.reset();
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::layer::numeric_diff;

  #[test]
  fn single_channel() {
    let mut conv = Conv2D::new(1, 1, [2, 2], 3, 3);
    conv.params_mut()[0].value = Tensor::ones(1, 4);
    let x = Tensor::row(&[1., 2., 3., 4., 5., 6., 7., 8., 9.]);
    let y = conv.forward(&x, false).unwrap();
    assert_eq!(y, Tensor::row(&[12., 16., 24., 28.]));
    let dx = conv.backward(&Tensor::ones(1, 4)).unwrap();
    assert_eq!(dx, Tensor::row(&[1., 2., 1., 2., 4., 2., 1., 2., 1.]));
    assert_eq!(conv.context().get("w"), Some(&Tensor::row(&[12., 16., 24., 28.])));
  }

  #[test]
  fn output_shape() {
    let mut conv = Conv2D::new(2, 4, [3, 3], 5, 5)
      .with_padding([1, 1])
      .with_stride([2, 2])
      .with_groups(2);
    assert_eq!(conv.params()[0].dims(), (4, 9));
    let y = conv.forward(&Tensor::randn(3, 50), true).unwrap();
    assert_eq!(y.dims(), (3, 4 * 3 * 3));
    assert!(conv.forward(&Tensor::randn(3, 49), true).is_err());
  }

  #[test]
  fn transposed_spreads_inputs() {
    let mut up = ConvTranspose2D::new(1, 1, [2, 2], 2, 2);
    up.params_mut()[0].value = Tensor::ones(1, 4);
    let y = up.forward(&Tensor::row(&[1., 2., 3., 4.]), false).unwrap();
    assert_eq!(y, Tensor::row(&[1., 3., 2., 4., 10., 6., 3., 7., 4.]));
    let dx = up.backward(&Tensor::ones(1, 9)).unwrap();
    assert_eq!(dx, Tensor::row(&[4., 4., 4., 4.]));
    assert_eq!(up.context().get("w"), Some(&Tensor::row(&[10., 10., 10., 10.])));
  }

  #[test]
  fn transposed_inverts_strided_shapes() {
    let mut up = ConvTranspose2D::new(2, 4, [3, 3], 3, 3)
      .with_stride([2, 2])
      .with_padding([1, 1])
      .with_output_padding([1, 1])
      .with_groups(2);
    assert_eq!(up.params()[0].dims(), (2, 18));
    assert_eq!(up.output_dims(), Some((6, 6)));
    let y = up.forward(&Tensor::randn(3, 18), true).unwrap();
    assert_eq!(y.dims(), (3, 4 * 6 * 6));
    let down = Conv2D::new(4, 2, [3, 3], 6, 6).with_stride([2, 2]).with_padding([1, 1]);
    assert_eq!(down.window().conv_output(), Some((3, 3)));
    assert!(up.forward(&Tensor::randn(3, 17), true).is_err());
    let mut invalid = ConvTranspose2D::new(1, 1, [2, 2], 2, 2).with_output_padding([1, 0]);
    assert!(matches!(invalid.forward(&Tensor::randn(1, 4), false), Err(Error::InvalidArgument(_))));
  }

  #[test]
  fn transposed_is_adjoint_of_conv() {
    // <conv(x), y> == <x, conv_transpose(y)> for shared kernels
    let mut down = Conv2D::new(2, 3, [3, 2], 5, 4).with_stride([2, 1]).with_padding([1, 0]);
    let mut up = ConvTranspose2D::new(3, 2, [3, 2], 3, 3).with_stride([2, 1]).with_padding([1, 0]);
    up.params_mut()[0].value = down.params()[0].value.clone();
    assert_eq!(up.output_dims(), Some((5, 4)));
    let x = Tensor::randn(1, 40);
    let y = Tensor::randn(1, 27);
    let lhs: f64 = (&down.forward(&x, false).unwrap() * &y).raw().iter().sum();
    let rhs: f64 = (&x * &up.forward(&y, false).unwrap()).raw().iter().sum();
    assert!((lhs - rhs).abs() < 1e-9, "{lhs} vs {rhs}");
  }

  #[test]
  fn transposed_gradients() {
    let mut up = ConvTranspose2D::new(2, 2, [2, 3], 3, 3).with_stride([2, 1]).with_dilation(2);
    let diff = numeric_diff(&mut up, &Tensor::randn(2, 18));
    assert!(diff < 1e-5, "{diff}");
    let mut seq = ConvTranspose1D::new(2, 3, 3, 4).with_stride(2).with_padding(1).with_output_padding(1);
    assert_eq!(seq.output_len(), Some(8));
    assert_eq!(seq.forward(&Tensor::randn(2, 8), false).unwrap().dims(), (2, 24));
    let diff = numeric_diff(&mut seq, &Tensor::randn(2, 8));
    assert!(diff < 1e-5, "{diff}");
  }

  #[test]
  fn restores() {
    let conv = Conv2D::new(2, 2, [2, 2], 4, 4).with_dilation(2);
    let params = conv.params().into_iter().cloned().collect();
    let mut restored = Conv2D::from_parts("c", params, &conv.args()).unwrap();
    let x = Tensor::randn(2, 32);
    let mut conv = conv;
    assert_eq!(conv.forward(&x, false).unwrap(), restored.forward(&x, false).unwrap());
  }
}
