// Geometry - Quad layout, texture sizing and scale factors
//
// This module provides:
// - The pre-transformed vertex layout used by the presentation quad
// - The texture size ladder (1024 → 2048 → 4096 → exact)
// - Scale factors mapping the logical framebuffer into texture UV space
// - Cutscene scaling against a fixed reference resolution
// - Viewport fitting (stretch or aspect-preserving boxing)

use bytemuck::{Pod, Zeroable};

/// Texture sides tried in order before falling back to the exact size
pub const TEXTURE_SIZE_LADDER: [u32; 3] = [1024, 2048, 4096];

/// Default cutscene reference width
pub const CUTSCENE_WIDTH: u32 = 640;

/// Default cutscene reference height
pub const CUTSCENE_HEIGHT: u32 = 400;

/// Pixel-center bias for rasterizers that sample at integer pixel coordinates
pub const HALF_PIXEL_BIAS: f32 = -0.5;

/// A single pre-transformed vertex of the presentation quad
///
/// Positions are in render-target pixels; `rhw` is always 1.0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub rhw: f32,
    pub u: f32,
    pub v: f32,
}

impl Vertex {
    /// Size of one vertex in bytes (stream stride)
    pub const STRIDE: usize = std::mem::size_of::<Vertex>();
}

/// Number of vertices in the presentation quad
pub const QUAD_VERTEX_COUNT: usize = 4;

/// Size of the quad vertex buffer in bytes
pub const QUAD_BYTES: usize = Vertex::STRIDE * QUAD_VERTEX_COUNT;

/// Output rectangle in render-target pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// Create a new viewport
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Fit a logical framebuffer into an output area
    ///
    /// Without `maintain_aspect` the framebuffer is stretched over the whole
    /// output. With it, the largest rectangle with the logical aspect ratio is
    /// centered, leaving bars on two sides.
    ///
    /// # Arguments
    /// * `logical` - Logical framebuffer size (width, height)
    /// * `output` - Output area size (width, height)
    /// * `maintain_aspect` - Preserve the logical aspect ratio
    pub fn fit(logical: (u32, u32), output: (u32, u32), maintain_aspect: bool) -> Self {
        let (lw, lh) = (logical.0.max(1) as u64, logical.1.max(1) as u64);
        let (ow, oh) = (output.0 as u64, output.1 as u64);

        if !maintain_aspect {
            return Self::new(0, 0, output.0, output.1);
        }

        // Compare ow/oh against lw/lh without floating point
        let (width, height) = if ow * lh > oh * lw {
            (oh * lw / lh, oh)
        } else {
            (ow, ow * lh / lw)
        };

        Self::new(
            ((ow - width) / 2) as u32,
            ((oh - height) / 2) as u32,
            width as u32,
            height as u32,
        )
    }

    /// Right edge (exclusive)
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive)
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

/// Choose one side of the square source texture for a framebuffer size
///
/// The side is the smallest ladder entry that holds both dimensions, or the
/// larger dimension itself once the ladder is exhausted.
///
/// # Arguments
/// * `width` - Framebuffer width in pixels
/// * `height` - Framebuffer height in pixels
///
/// # Returns
/// Texture (width, height); always square
pub fn texture_size_for(width: u32, height: u32) -> (u32, u32) {
    let ladder = |n: u32| {
        TEXTURE_SIZE_LADDER
            .iter()
            .copied()
            .find(|&side| n <= side)
            .unwrap_or(n)
    };

    let tex_width = ladder(width);
    let tex_height = if height <= tex_width {
        tex_width
    } else {
        ladder(height)
    };

    let side = tex_width.max(tex_height);
    (side, side)
}

/// Scale factors mapping logical pixels to texture UV space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleState {
    pub width: f32,
    pub height: f32,
}

impl ScaleState {
    /// Derive the scale for a framebuffer stored in a texture
    ///
    /// # Arguments
    /// * `logical` - Logical framebuffer size (width, height)
    /// * `texture` - Texture size (width, height)
    pub fn new(logical: (u32, u32), texture: (u32, u32)) -> Self {
        Self {
            width: logical.0 as f32 / texture.0 as f32,
            height: logical.1 as f32 / texture.1 as f32,
        }
    }

    /// Scale used while a cutscene is playing
    ///
    /// Derived from `self` on every call; the base scale is never modified.
    pub fn for_cutscene(&self, cutscene: &CutsceneScale) -> Self {
        Self {
            width: self.width * (cutscene.reference.0 as f32 / cutscene.logical.0 as f32),
            height: self.height * (cutscene.reference.1 as f32 / cutscene.logical.1 as f32),
        }
    }
}

/// Reference and logical resolutions used for cutscene scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutsceneScale {
    /// Resolution the cutscene was authored for
    pub reference: (u32, u32),
    /// Logical framebuffer resolution
    pub logical: (u32, u32),
}

impl CutsceneScale {
    /// Cutscene scaling against the default 640×400 reference
    pub fn new(logical: (u32, u32)) -> Self {
        Self {
            reference: (CUTSCENE_WIDTH, CUTSCENE_HEIGHT),
            logical,
        }
    }
}

/// Compute the presentation quad
///
/// Produces a triangle strip covering `viewport` (bottom-left, top-left,
/// bottom-right, top-right). UVs run from (0, scale_h) to (scale_w, 0).
///
/// # Arguments
/// * `viewport` - Output rectangle in render-target pixels
/// * `scale` - Base scale state
/// * `cutscene` - Cutscene scaling, when a cutscene is playing
/// * `pixel_center_bias` - Offset added to every position (see `HALF_PIXEL_BIAS`)
pub fn compute_quad(
    viewport: Viewport,
    scale: ScaleState,
    cutscene: Option<&CutsceneScale>,
    pixel_center_bias: f32,
) -> [Vertex; QUAD_VERTEX_COUNT] {
    let left = viewport.x as f32 + pixel_center_bias;
    let top = viewport.y as f32 + pixel_center_bias;
    let right = viewport.right() as f32 + pixel_center_bias;
    let bottom = viewport.bottom() as f32 + pixel_center_bias;

    let scale = match cutscene {
        Some(cutscene) => scale.for_cutscene(cutscene),
        None => scale,
    };

    let vertex = |x: f32, y: f32, u: f32, v: f32| Vertex {
        x,
        y,
        z: 0.0,
        rhw: 1.0,
        u,
        v,
    };

    [
        vertex(left, bottom, 0.0, scale.height),
        vertex(left, top, 0.0, 0.0),
        vertex(right, bottom, scale.width, scale.height),
        vertex(right, top, scale.width, 0.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_stride() {
        assert_eq!(Vertex::STRIDE, 24);
        assert_eq!(QUAD_BYTES, 96);
    }

    #[test]
    fn test_texture_ladder() {
        assert_eq!(texture_size_for(640, 480), (1024, 1024));
        assert_eq!(texture_size_for(1024, 1024), (1024, 1024));
        assert_eq!(texture_size_for(1025, 768), (2048, 2048));
        assert_eq!(texture_size_for(800, 3000), (4096, 4096));
        assert_eq!(texture_size_for(4096, 100), (4096, 4096));
        assert_eq!(texture_size_for(5000, 6000), (6000, 6000));
        assert_eq!(texture_size_for(7000, 10), (7000, 7000));
    }

    #[test]
    fn test_texture_ladder_is_smallest_fit() {
        for &(w, h) in &[(1, 1), (320, 200), (1920, 1080), (2560, 1440), (3840, 4200)] {
            let (side, other) = texture_size_for(w, h);
            assert_eq!(side, other);

            let needed = w.max(h);
            assert!(side >= needed);

            let expected = TEXTURE_SIZE_LADDER
                .iter()
                .copied()
                .find(|&s| s >= needed)
                .unwrap_or(needed);
            assert_eq!(side, expected);
        }
    }

    #[test]
    fn test_scale_state() {
        let scale = ScaleState::new((640, 480), (1024, 1024));
        assert_eq!(scale.width, 0.625);
        assert_eq!(scale.height, 0.46875);
    }

    #[test]
    fn test_cutscene_scale_restores_base() {
        let base = ScaleState::new((800, 600), (1024, 1024));
        let cutscene = CutsceneScale::new((800, 600));

        let scaled = base.for_cutscene(&cutscene);
        assert_eq!(scaled.width, base.width * (640.0 / 800.0));
        assert_eq!(scaled.height, base.height * (400.0 / 600.0));

        let normal = compute_quad(Viewport::new(0, 0, 800, 600), base, None, 0.0);
        let toggled = compute_quad(Viewport::new(0, 0, 800, 600), base, Some(&cutscene), 0.0);
        let restored = compute_quad(Viewport::new(0, 0, 800, 600), base, None, 0.0);

        assert_ne!(normal, toggled);
        assert_eq!(normal, restored);
    }

    #[test]
    fn test_quad_layout() {
        let scale = ScaleState::new((640, 480), (1024, 1024));
        let quad = compute_quad(Viewport::new(10, 20, 640, 480), scale, None, HALF_PIXEL_BIAS);

        assert_eq!((quad[0].x, quad[0].y), (9.5, 499.5));
        assert_eq!((quad[1].x, quad[1].y), (9.5, 19.5));
        assert_eq!((quad[2].x, quad[2].y), (649.5, 499.5));
        assert_eq!((quad[3].x, quad[3].y), (649.5, 19.5));

        assert_eq!((quad[0].u, quad[0].v), (0.0, scale.height));
        assert_eq!((quad[1].u, quad[1].v), (0.0, 0.0));
        assert_eq!((quad[2].u, quad[2].v), (scale.width, scale.height));
        assert_eq!((quad[3].u, quad[3].v), (scale.width, 0.0));

        assert!(quad.iter().all(|v| v.z == 0.0 && v.rhw == 1.0));
    }

    #[test]
    fn test_viewport_fit_stretch() {
        let vp = Viewport::fit((640, 480), (1920, 1080), false);
        assert_eq!(vp, Viewport::new(0, 0, 1920, 1080));
    }

    #[test]
    fn test_viewport_fit_pillarbox() {
        let vp = Viewport::fit((640, 480), (1920, 1080), true);
        assert_eq!(vp, Viewport::new(240, 0, 1440, 1080));
    }

    #[test]
    fn test_viewport_fit_letterbox() {
        let vp = Viewport::fit((640, 400), (1280, 1024), true);
        assert_eq!(vp, Viewport::new(0, 112, 1280, 800));
    }
}
