//! Hand-specified weights shared by the numeric regression tests.
//!
//! Geometry: embed 4, heads 2, feed-forward 3, vocab 10, one layer.
//! Every self-attention block uses the same projections; the W_k, W_v and
//! W_o weights differ from W_q only in their first element.

use crate::layers::{DecoderLayer, EncoderLayer, Linear, MultiHeadAttention, PositionwiseFeedForward};
use crate::model::{Transformer, TransformerConfig};
use crate::tensor::Tensor;

/// `[rows, cols]` tensor from literal rows
pub(crate) fn mat(rows: &[&[f32]]) -> Tensor {
    let cols = rows.first().map(|r| r.len()).unwrap_or(0);
    Tensor::new(rows.concat(), vec![rows.len(), cols])
}

/// `[1, rows, cols]` tensor from literal rows
pub(crate) fn seq(rows: &[&[f32]]) -> Tensor {
    let m = mat(rows);
    let shape = vec![1, m.shape[0], m.shape[1]];
    m.reshape(&shape)
}

fn linear(weight: Tensor, bias: &[f32]) -> Linear {
    Linear::from_tensors(weight, Tensor::new(bias.to_vec(), vec![bias.len()])).unwrap()
}

const SELF_W: [[f32; 4]; 4] = [
    [-1.2321, -0.4785, -0.4598, -0.1860],
    [0.4576, 0.4961, -0.0903, -0.4833],
    [-0.1442, 0.3495, 0.4236, -0.0846],
    [-0.3082, 0.0956, -0.2470, 0.3061],
];
const SELF_B: [f32; 4] = [-1.3717, -0.1179, -0.0096, -0.4240];

fn shifted(shift: f32) -> Linear {
    let mut w = SELF_W;
    let mut b = SELF_B;
    w[0][0] += shift;
    b[0] += shift;
    linear(Tensor::new(w.concat(), vec![4, 4]), &b)
}

pub(crate) fn self_attention() -> MultiHeadAttention {
    let mut mha = MultiHeadAttention::new(4, 2, 0.0, 0).unwrap();
    mha.w_q = shifted(0.0);
    mha.w_k = shifted(-1.0);
    mha.w_v = shifted(-2.0);
    mha.w_o = shifted(-3.0);
    mha
}

pub(crate) fn cross_attention() -> MultiHeadAttention {
    let mut mha = MultiHeadAttention::new(4, 2, 0.0, 0).unwrap();
    mha.w_q = linear(
        mat(&[
            &[0.0675, 0.0034, 0.2860, -0.0438],
            &[0.3234, 0.4208, -0.0814, -0.0883],
            &[-0.3376, 0.2880, 0.0641, -0.4295],
            &[0.4480, 0.4328, -0.4657, 0.1207],
        ]),
        &[-0.3390, 0.0716, 0.4804, -0.4253],
    );
    mha.w_k = linear(
        mat(&[
            &[0.2975, 0.0247, 0.4618, -0.1429],
            &[-0.0016, -0.0542, -0.3919, 0.1051],
            &[0.4285, 0.0760, -0.3002, -0.2579],
            &[-0.1038, 0.4511, 0.4412, 0.2605],
        ]),
        &[-0.3793, 0.4552, 0.1502, 0.3554],
    );
    mha.w_v = linear(
        mat(&[
            &[-0.4192, -0.4004, 0.0120, -0.4717],
            &[-0.3308, -0.4728, -0.1381, 0.3374],
            &[0.1521, -0.1548, 0.2885, 0.4352],
            &[-0.1196, -0.2579, -0.3167, 0.0128],
        ]),
        &[0.4992, -0.2558, 0.1871, -0.3701],
    );
    mha.w_o = linear(
        mat(&[
            &[0.15146, 0.050816, 0.00039053, -0.46405],
            &[-0.12832, -0.43910, -0.18390, -0.051324],
            &[0.44734, -0.33816, 0.13738, -0.13041],
            &[0.18204, -0.29708, 0.32434, -0.063109],
        ]),
        &[-0.4427, -0.0959, -0.2821, -0.2209],
    );
    mha
}

pub(crate) fn feed_forward() -> PositionwiseFeedForward {
    let mut ff = PositionwiseFeedForward::new(4, 3, 0.0, 0).unwrap();
    ff.w_1 = linear(
        mat(&[
            &[-5.4208, 0.2836, -0.1770, 0.3684],
            &[0.3448, 0.4124, -0.2545, 0.2874],
            &[-0.4372, 0.4165, -0.2362, 0.1144],
        ]),
        &[5.2621, -0.3262, 0.4815],
    );
    ff.w_2 = linear(
        mat(&[
            &[-6.3926, -0.1717, 0.2300],
            &[0.0701, 0.3166, -0.2458],
            &[0.1431, -0.3391, 0.5407],
            &[0.4126, -0.3719, 0.5352],
        ]),
        &[-6.5333, -0.0515, -0.1337, 0.0297],
    );
    ff
}

pub(crate) fn encoder_layer() -> EncoderLayer {
    let mut layer = EncoderLayer::new(4, 2, 3, 0.0, 1e-5, 0).unwrap();
    layer.self_attn = self_attention();
    layer.feed_forward = feed_forward();
    layer
}

pub(crate) fn decoder_layer() -> DecoderLayer {
    let mut layer = DecoderLayer::new(4, 2, 3, 0.0, 1e-5, 0).unwrap();
    layer.self_attn = self_attention();
    layer.cross_attn = cross_attention();
    layer.feed_forward = feed_forward();
    layer
}

pub(crate) fn encoder_input() -> Tensor {
    seq(&[
        &[1.0, 2.0, 3.0, 4.0],
        &[5.0, 6.0, 7.0, 8.0],
        &[0.0878, 0.0416, 0.6166, 0.1477],
        &[-0.3883, 0.2742, -0.4652, -0.1417],
        &[0.5300, 0.2800, 0.5306, 0.4950],
    ])
}

/// Encoder output for [`encoder_input`], used as decoder memory
pub(crate) fn encoder_memory() -> Tensor {
    seq(&[
        &[-1.7227, 0.4192, 0.5928, 0.7106],
        &[-1.7228, 0.4187, 0.5948, 0.7092],
        &[-1.7241, 0.4332, 0.5882, 0.7027],
        &[-1.7244, 0.4406, 0.5782, 0.7056],
        &[-1.7241, 0.4344, 0.5848, 0.7048],
    ])
}

pub(crate) fn decoder_input() -> Tensor {
    seq(&[
        &[0.1878, 0.5416, -0.1166, 0.4477],
        &[0.2878, -0.6416, 0.2166, -0.9477],
        &[0.0878, 0.0416, 0.6166, 0.1477],
        &[-0.3883, 0.2742, -0.4652, -0.1417],
        &[0.5300, 0.2800, 0.5306, 0.4950],
    ])
}

pub(crate) const FC_BIAS: [f32; 10] = [
    0.1317, -0.1626, -0.0434, -0.4033, 0.0458, -0.1930, 0.3019, -0.3306, -0.1221, 0.3670,
];

/// Output bias under which greedy decoding alternates between tokens 5 and 3
pub(crate) const FC_BIAS_ALTERNATING: [f32; 10] = [
    0.1317, -0.1626, -0.0434, -0.3033, 0.0458, -0.0930, 0.3019, -0.3306, -0.2221, -0.2330,
];

pub(crate) fn config() -> TransformerConfig {
    TransformerConfig::tiny(10, 10)
}

/// Full model with every weight pinned
pub(crate) fn transformer(fc_bias: &[f32; 10]) -> Transformer {
    let mut model = Transformer::new(config()).unwrap();
    model.encoder_embedding.weight.value = mat(&[
        &[-1.5104, -0.0284, 0.8700, 0.8670],
        &[1.1990, 1.1361, 0.8644, 0.1473],
        &[-0.7335, 0.3807, 0.7741, 0.4396],
        &[-0.7043, 1.6892, -0.5124, 0.4657],
        &[0.0162, -1.9550, 1.6194, 1.5560],
        &[1.3285, 0.2094, -1.5481, 0.2234],
        &[-0.8587, -0.4757, 0.1260, -1.9552],
        &[-0.7352, -0.9533, -0.7015, -1.8978],
        &[-0.3166, 1.9976, 0.1297, 0.9044],
        &[0.7586, -1.0734, -0.4338, -0.8578],
    ]);
    model.decoder_embedding.weight.value = mat(&[
        &[-0.5281, 0.1697, -0.9366, 0.0129],
        &[0.1969, -1.1860, 0.0961, -0.6315],
        &[-0.1603, -0.1080, 0.1573, 0.9020],
        &[1.2745, 0.0302, 1.0822, -0.4542],
        &[-0.5246, -0.9769, -0.6335, 2.4609],
        &[-0.7565, 1.0006, -1.5738, 1.5421],
        &[-0.7897, -3.4246, 0.4188, -1.1293],
        &[0.9453, -0.1520, -0.7238, 0.7383],
        &[0.0729, 0.3859, 0.0163, -0.9825],
        &[-0.9148, 1.0367, -1.0432, 1.4304],
    ]);
    model.encoder.layers[0] = encoder_layer();
    model.decoder.layers[0] = decoder_layer();
    model.fc = linear(
        mat(&[
            &[0.4024, 0.2209, -0.3322, -0.2039],
            &[-0.0586, -0.3453, -0.4044, 0.3376],
            &[-0.4428, 0.0175, -0.4929, -0.2737],
            &[-0.4433, -0.2716, -0.0390, 0.4631],
            &[-0.0599, 0.1389, 0.0554, -0.2265],
            &[-0.4810, -0.2936, 0.2530, -0.0608],
            &[0.1361, 0.1135, -0.1584, -0.0923],
            &[0.3696, -0.2719, -0.0755, 0.3822],
            &[-0.2697, 0.1172, -0.0242, 0.4085],
            &[-0.2495, -0.1300, 0.2470, 0.3172],
        ]),
        fc_bias,
    );
    model
}
