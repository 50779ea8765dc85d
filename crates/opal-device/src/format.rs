//! Resource formats and the metadata queries the binding rules depend on.

use crate::resource::DsvFlags;

/// Representative format set. The interesting distinction for the binding
/// rules is which planes (color, depth, stencil) a format exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Rgba16Float,
    R32Float,
    D16Unorm,
    D24UnormS8Uint,
    D32Float,
    D32FloatS8Uint,
    S8Uint,
}

impl Format {
    pub fn has_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D24UnormS8Uint | Format::D32Float | Format::D32FloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            Format::D24UnormS8Uint | Format::D32FloatS8Uint | Format::S8Uint
        )
    }

    pub fn is_depth_stencil(self) -> bool {
        self.has_depth() || self.has_stencil()
    }
}

/// Whether a depth-stencil view and a shader-resource view over the same
/// resource alias in a conflicting (read/write hazard) way.
///
/// Depth/stencil formats are multi-planar: an SRV may expose only the depth
/// plane or only the stencil plane. The views conflict iff the SRV reads a
/// plane the DSV may write; a plane the DSV binds read-only never hazards.
/// An SRV with a color format over a depth-stencil resource reads whatever
/// plane the format reinterprets, so treat it as reading all planes.
pub fn dsv_srv_conflict(dsv_format: Format, dsv_flags: DsvFlags, srv_format: Format) -> bool {
    let dsv_writes_depth = dsv_format.has_depth() && !dsv_flags.contains(DsvFlags::READ_ONLY_DEPTH);
    let dsv_writes_stencil =
        dsv_format.has_stencil() && !dsv_flags.contains(DsvFlags::READ_ONLY_STENCIL);

    let (srv_reads_depth, srv_reads_stencil) = if srv_format.is_depth_stencil() {
        (srv_format.has_depth(), srv_format.has_stencil())
    } else {
        // Color-format reinterpretation of a depth-stencil resource.
        (true, true)
    };

    (dsv_writes_depth && srv_reads_depth) || (dsv_writes_stencil && srv_reads_stencil)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_depth_stencil_exposes_both_planes() {
        assert!(Format::D24UnormS8Uint.has_depth());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(Format::D32Float.has_depth());
        assert!(!Format::D32Float.has_stencil());
        assert!(!Format::Rgba8Unorm.is_depth_stencil());
    }

    #[test]
    fn writable_dsv_conflicts_with_depth_srv() {
        assert!(dsv_srv_conflict(
            Format::D24UnormS8Uint,
            DsvFlags::empty(),
            Format::D32Float,
        ));
    }

    #[test]
    fn read_only_depth_does_not_conflict_with_depth_srv() {
        assert!(!dsv_srv_conflict(
            Format::D32Float,
            DsvFlags::READ_ONLY_DEPTH,
            Format::D32Float,
        ));
        // But a stencil-reading SRV still hazards a packed format whose
        // stencil plane remains writable.
        assert!(dsv_srv_conflict(
            Format::D24UnormS8Uint,
            DsvFlags::READ_ONLY_DEPTH,
            Format::S8Uint,
        ));
    }

    #[test]
    fn disjoint_planes_do_not_conflict() {
        // Depth-only DSV vs stencil-only SRV.
        assert!(!dsv_srv_conflict(
            Format::D32Float,
            DsvFlags::empty(),
            Format::S8Uint,
        ));
    }

    #[test]
    fn color_reinterpretation_conflicts_unless_fully_read_only() {
        assert!(dsv_srv_conflict(
            Format::D24UnormS8Uint,
            DsvFlags::empty(),
            Format::R32Float,
        ));
        assert!(!dsv_srv_conflict(
            Format::D24UnormS8Uint,
            DsvFlags::READ_ONLY_DEPTH | DsvFlags::READ_ONLY_STENCIL,
            Format::R32Float,
        ));
    }
}
