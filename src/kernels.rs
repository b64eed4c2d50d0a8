// Built-in compute kernels
//
// SPIR-V assembled by hand so the crate builds without the Vulkan SDK. The
// increment kernel is equivalent to shaders/increment.comp:
//
//   layout(local_size_x = 1024) in;
//   layout(std430, binding = 0) buffer Data { double values[]; };
//   void main() { values[gl_GlobalInvocationID.x] += 1.0; }

use crate::backend::ResourceKind;

/// Invocations per work group of [`increment_f64`].
pub const INCREMENT_LOCAL_SIZE: u32 = 1024;

/// Slot layout expected by [`increment_f64`].
pub const INCREMENT_SLOTS: &[ResourceKind] = &[ResourceKind::StorageBuffer];

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[rustfmt::skip]
const INCREMENT_F64_WORDS: &[u32] = &[
    // Header: magic, version 1.0, generator, id bound, schema
    SPIRV_MAGIC, 0x0001_0000, 0, 25, 0,

    0x0002_0011, 1,                              // OpCapability Shader
    0x0002_0011, 10,                             // OpCapability Float64
    0x0003_000E, 0, 1,                           // OpMemoryModel Logical GLSL450
    0x0006_000F, 5, 18, 0x6E69_616D, 0, 6,       // OpEntryPoint GLCompute %18 "main" %6
    0x0006_0010, 18, 17, INCREMENT_LOCAL_SIZE, 1, 1, // OpExecutionMode %18 LocalSize 1024 1 1

    0x0004_0047, 6, 11, 28,                      // OpDecorate %6 BuiltIn GlobalInvocationId
    0x0004_0047, 8, 6, 8,                        // OpDecorate %8 ArrayStride 8
    0x0005_0048, 9, 0, 35, 0,                    // OpMemberDecorate %9 0 Offset 0
    0x0003_0047, 9, 3,                           // OpDecorate %9 BufferBlock
    0x0004_0047, 11, 34, 0,                      // OpDecorate %11 DescriptorSet 0
    0x0004_0047, 11, 33, 0,                      // OpDecorate %11 Binding 0

    0x0002_0013, 1,                              // %1 = OpTypeVoid
    0x0003_0021, 2, 1,                           // %2 = OpTypeFunction %1
    0x0004_0015, 3, 32, 0,                       // %3 = OpTypeInt 32 0
    0x0004_0017, 4, 3, 3,                        // %4 = OpTypeVector %3 3
    0x0004_0020, 5, 1, 4,                        // %5 = OpTypePointer Input %4
    0x0004_003B, 5, 6, 1,                        // %6 = OpVariable %5 Input
    0x0003_0016, 7, 64,                          // %7 = OpTypeFloat 64
    0x0003_001D, 8, 7,                           // %8 = OpTypeRuntimeArray %7
    0x0003_001E, 9, 8,                           // %9 = OpTypeStruct %8
    0x0004_0020, 10, 2, 9,                       // %10 = OpTypePointer Uniform %9
    0x0004_003B, 10, 11, 2,                      // %11 = OpVariable %10 Uniform
    0x0004_0015, 12, 32, 1,                      // %12 = OpTypeInt 32 1
    0x0004_002B, 12, 13, 0,                      // %13 = OpConstant %12 0
    0x0004_002B, 3, 14, 0,                       // %14 = OpConstant %3 0
    0x0004_0020, 15, 1, 3,                       // %15 = OpTypePointer Input %3
    0x0004_0020, 16, 2, 7,                       // %16 = OpTypePointer Uniform %7
    0x0005_002B, 7, 17, 0x0000_0000, 0x3FF0_0000, // %17 = OpConstant %7 1.0

    0x0005_0036, 1, 18, 0, 2,                    // %18 = OpFunction %1 None %2
    0x0002_00F8, 19,                             // %19 = OpLabel
    0x0005_0041, 15, 20, 6, 14,                  // %20 = OpAccessChain %15 %6 %14
    0x0004_003D, 3, 21, 20,                      // %21 = OpLoad %3 %20
    0x0006_0041, 16, 22, 11, 13, 21,             // %22 = OpAccessChain %16 %11 %13 %21
    0x0004_003D, 7, 23, 22,                      // %23 = OpLoad %7 %22
    0x0005_0081, 7, 24, 23, 17,                  // %24 = OpFAdd %7 %23 %17
    0x0003_003E, 22, 24,                         // OpStore %22 %24
    0x0001_00FD,                                 // OpReturn
    0x0001_0038,                                 // OpFunctionEnd
];

/// SPIR-V for the double-precision increment kernel, as little-endian bytes.
///
/// Binds one storage buffer at set 0, binding 0 and adds `1.0` to the element
/// indexed by the global invocation id. Needs the `shaderFloat64` feature.
pub fn increment_f64() -> Vec<u8> {
    INCREMENT_F64_WORDS
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_kernel_has_valid_header() {
        let bytes = increment_f64();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(&bytes[..4], &SPIRV_MAGIC.to_le_bytes());
        // id bound must exceed every id used
        assert_eq!(INCREMENT_F64_WORDS[3], 25);
    }

    #[test]
    fn instruction_word_counts_tile_the_module() {
        // Walking the stream by each instruction's declared length must land
        // exactly on the end of the module.
        let mut offset = 5;
        while offset < INCREMENT_F64_WORDS.len() {
            let count = (INCREMENT_F64_WORDS[offset] >> 16) as usize;
            assert!(count > 0, "zero-length instruction at word {offset}");
            offset += count;
        }
        assert_eq!(offset, INCREMENT_F64_WORDS.len());
    }
}
