//! Summary statistics of a morphology tree.

use serde::{Deserialize, Serialize};
use tracing::debug;

use arbor_types::FeatureSet;

use crate::sholl::ShollAnalyzer;
use crate::tree::{distance, Morphology, Point3, Section, SectionKind};

/// Derives a complete [`FeatureSet`] from a [`Morphology`].
///
/// Topology and length statistics cover every section. The radial extent and
/// the Sholl curve cover the radial section set, which excludes axonal
/// subtrees when `dendrites_only` is set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureExtractor {
    pub sholl: ShollAnalyzer,
    pub dendrites_only: bool,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            sholl: ShollAnalyzer::default(),
            dendrites_only: true,
        }
    }
}

impl FeatureExtractor {
    pub fn new(sholl: ShollAnalyzer) -> Self {
        Self {
            sholl,
            ..Self::default()
        }
    }

    pub fn with_dendrites_only(mut self, dendrites_only: bool) -> Self {
        self.dendrites_only = dendrites_only;
        self
    }

    fn is_radial(&self, section: &Section) -> bool {
        !(self.dendrites_only && section.kind == SectionKind::Axon)
    }

    pub fn extract(&self, morphology: &Morphology) -> FeatureSet {
        let sections = morphology.sections();

        let mut total_length = 0.0;
        let mut n_bifurcations = 0u32;
        let mut n_tips = 0u32;
        let mut max_depth = 0u32;
        for (id, depth) in morphology.walk(|_| true) {
            let section = &sections[id];
            total_length += section.length();
            max_depth = max_depth.max(depth);
            match section.children.len() {
                0 => n_tips += 1,
                1 => {}
                _ => n_bifurcations += 1,
            }
        }

        let radial: Vec<&[Point3]> = morphology
            .walk(|s| self.is_radial(s))
            .into_iter()
            .map(|(id, _)| sections[id].points.as_slice())
            .collect();
        let center = morphology.soma_center;
        let max_radial_extent = radial
            .iter()
            .flat_map(|points| points.iter())
            .map(|p| distance(p, &center))
            .fold(0.0, f64::max);
        let sholl = self.sholl.compute(&radial, &center);

        debug!(
            sections = sections.len(),
            radial_sections = radial.len(),
            total_length,
            n_bifurcations,
            n_tips,
            "extracted morphology features"
        );

        FeatureSet::new(
            total_length,
            n_bifurcations,
            n_tips,
            max_depth,
            max_radial_extent,
            sholl,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Soma at the origin, a dendrite that forks once, and a straight axon.
    fn forked_neuron() -> Morphology {
        let mut m = Morphology::new([0.0; 3]);
        let trunk = m
            .add_section(None, SectionKind::Dendrite, vec![[0.0; 3], [20.0, 0.0, 0.0]])
            .unwrap();
        m.add_section(
            Some(trunk),
            SectionKind::Dendrite,
            vec![[20.0, 0.0, 0.0], [20.0, 15.0, 0.0]],
        )
        .unwrap();
        m.add_section(
            Some(trunk),
            SectionKind::Dendrite,
            vec![[20.0, 0.0, 0.0], [20.0, -15.0, 0.0]],
        )
        .unwrap();
        m.add_section(
            None,
            SectionKind::Axon,
            vec![[0.0; 3], [-100.0, 0.0, 0.0]],
        )
        .unwrap();
        m
    }

    #[test]
    fn counts_topology_over_all_sections() {
        let features = FeatureExtractor::default().extract(&forked_neuron());
        assert_eq!(features.total_length_um, Some(150.0));
        assert_eq!(features.n_bifurcations, Some(1));
        assert_eq!(features.n_tips, Some(3));
        assert_eq!(features.max_tree_depth, Some(1));
    }

    #[test]
    fn radial_features_skip_axon() {
        let features = FeatureExtractor::default().extract(&forked_neuron());
        assert_eq!(features.max_radial_extent_um, Some(25.0));

        let sholl = features.sholl.unwrap();
        assert_eq!(sholl.radii(), &[10.0, 20.0, 30.0, 40.0]);
        assert_eq!(sholl.counts(), &[1, 2, 0, 0]);
        assert!(features.max_radial_extent_um.unwrap() <= *sholl.radii().last().unwrap());
    }

    #[test]
    fn radial_features_can_include_axon() {
        let extractor = FeatureExtractor::default().with_dendrites_only(false);
        let features = extractor.extract(&forked_neuron());
        assert_eq!(features.max_radial_extent_um, Some(100.0));
        let sholl = features.sholl.unwrap();
        assert_eq!(sholl.len(), 11);
        assert_eq!(sholl.counts()[4], 1);
    }

    #[test]
    fn empty_morphology() {
        let features = FeatureExtractor::default().extract(&Morphology::new([1.0, 2.0, 3.0]));
        assert_eq!(features.total_length_um, Some(0.0));
        assert_eq!(features.n_tips, Some(0));
        assert_eq!(features.max_radial_extent_um, Some(0.0));
        let sholl = features.sholl.unwrap();
        assert_eq!(sholl.radii(), &[10.0]);
        assert_eq!(sholl.counts(), &[0]);
    }
}
