//! In-memory rooted morphology tree.

use serde::{Deserialize, Serialize};
use std::path::Path;

use arbor_types::{ArborError, ArborResult};

/// A point in 3D space (micrometres).
pub type Point3 = [f64; 3];

/// Index of a section inside its [`Morphology`].
pub type SectionId = usize;

/// Euclidean distance between two points.
pub fn distance(a: &Point3, b: &Point3) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Neurite type of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Dendrite,
    ApicalDendrite,
    Axon,
    Other,
}

/// One unbranched polyline of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub points: Vec<Point3>,
    pub parent: Option<SectionId>,
    pub children: Vec<SectionId>,
}

impl Section {
    /// Sum of consecutive segment lengths.
    pub fn length(&self) -> f64 {
        self.points
            .windows(2)
            .map(|pair| distance(&pair[0], &pair[1]))
            .sum()
    }
}

/// A neuron reconstruction: soma center plus a forest of sections.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Morphology {
    pub soma_center: Point3,
    sections: Vec<Section>,
}

/// On-disk section: children are implied by the parent links.
#[derive(Debug, Deserialize)]
struct SectionRecord {
    kind: SectionKind,
    #[serde(default)]
    parent: Option<SectionId>,
    points: Vec<Point3>,
}

#[derive(Debug, Deserialize)]
struct MorphologyRecord {
    #[serde(default)]
    soma_center: Point3,
    sections: Vec<SectionRecord>,
}

impl Morphology {
    pub fn new(soma_center: Point3) -> Self {
        Self {
            soma_center,
            sections: Vec::new(),
        }
    }

    /// Append a section, attaching it to `parent` when given.
    pub fn add_section(
        &mut self,
        parent: Option<SectionId>,
        kind: SectionKind,
        points: Vec<Point3>,
    ) -> ArborResult<SectionId> {
        if let Some(parent_id) = parent {
            if parent_id >= self.sections.len() {
                return Err(ArborError::InvalidMorphology {
                    message: format!(
                        "parent section {parent_id} does not exist ({} sections)",
                        self.sections.len()
                    ),
                });
            }
        }
        if let Some(p) = points.iter().flatten().find(|c| !c.is_finite()) {
            return Err(ArborError::InvalidMorphology {
                message: format!("non-finite coordinate {p}"),
            });
        }

        let id = self.sections.len();
        self.sections.push(Section {
            kind,
            points,
            parent,
            children: Vec::new(),
        });
        if let Some(parent_id) = parent {
            self.sections[parent_id].children.push(id);
        }
        Ok(id)
    }

    /// Parse `{"soma_center": [x, y, z], "sections": [{"kind", "parent",
    /// "points"}]}`. Sections are added in file order, so a parent must be
    /// listed before its children.
    pub fn from_json_str(json: &str) -> ArborResult<Self> {
        let record: MorphologyRecord = serde_json::from_str(json)?;
        let mut morphology = Morphology::new(record.soma_center);
        for section in record.sections {
            morphology.add_section(section.parent, section.kind, section.points)?;
        }
        Ok(morphology)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ArborResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(id)
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Sections without a parent.
    pub fn root_ids(&self) -> impl Iterator<Item = SectionId> + '_ {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.parent.is_none())
            .map(|(id, _)| id)
    }

    /// Depth-first walk yielding `(id, depth)`, roots at depth 0. Sections
    /// rejected by `keep` are skipped together with their subtree.
    pub fn walk<F>(&self, keep: F) -> Vec<(SectionId, u32)>
    where
        F: Fn(&Section) -> bool,
    {
        let mut visited = Vec::with_capacity(self.sections.len());
        for root in self.root_ids() {
            let mut stack = vec![(root, 0u32)];
            while let Some((id, depth)) = stack.pop() {
                let section = &self.sections[id];
                if !keep(section) {
                    continue;
                }
                visited.push((id, depth));
                stack.extend(section.children.iter().map(|child| (*child, depth + 1)));
            }
        }
        visited
    }
}
