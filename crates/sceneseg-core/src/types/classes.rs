use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SceneSegError};

/// Cityscapes training classes, indexed the way label matrices store them.
pub const CITYSCAPES_CLASSES: [&str; 19] = [
    "road",
    "sidewalk",
    "building",
    "wall",
    "fence",
    "pole",
    "traffic light",
    "traffic sign",
    "vegetation",
    "terrain",
    "sky",
    "person",
    "rider",
    "car",
    "truck",
    "bus",
    "train",
    "motorcycle",
    "bicycle",
];

/// Display colours per known class; the trailing entry paints "other".
pub const CITYSCAPES_PALETTE: [[u8; 3]; 20] = [
    [128, 54, 128],
    [244, 35, 232],
    [70, 70, 70],
    [102, 102, 156],
    [190, 153, 153],
    [153, 153, 153],
    [250, 170, 30],
    [220, 220, 0],
    [107, 142, 35],
    [152, 251, 152],
    [70, 130, 180],
    [220, 20, 60],
    [255, 0, 0],
    [0, 0, 142],
    [0, 0, 70],
    [0, 60, 100],
    [0, 80, 100],
    [0, 0, 230],
    [119, 11, 32],
    [0, 0, 0],
];

const OTHER_COLOR: [u8; 3] = CITYSCAPES_PALETTE[19];

/// The ordered subset of known classes a network is trained on.
///
/// Network output channel `i < len()` stands for known class
/// `indices()[i]`; channel `len()` is the synthetic "other" class that
/// covers unlabeled pixels and every class left out of the selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct ClassSet {
    indices: Vec<usize>,
}

impl ClassSet {
    /// Builds a class set from known-class indices, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns `SceneSegError::InvalidClasses` when the list is empty,
    /// repeats an index or names a class outside [`CITYSCAPES_CLASSES`].
    pub fn new(indices: impl Into<Vec<usize>>) -> Result<Self> {
        let indices = indices.into();
        if indices.is_empty() {
            return Err(SceneSegError::InvalidClasses("no classes selected".into()));
        }
        let mut seen = [false; CITYSCAPES_CLASSES.len()];
        for &idx in &indices {
            if idx >= CITYSCAPES_CLASSES.len() {
                return Err(SceneSegError::InvalidClasses(format!(
                    "class index {idx} is outside 0..{}",
                    CITYSCAPES_CLASSES.len()
                )));
            }
            if std::mem::replace(&mut seen[idx], true) {
                return Err(SceneSegError::InvalidClasses(format!(
                    "duplicate class index {idx}"
                )));
            }
        }
        Ok(Self { indices })
    }

    /// All 19 Cityscapes training classes.
    #[must_use]
    pub fn all() -> Self {
        Self {
            indices: (0..CITYSCAPES_CLASSES.len()).collect(),
        }
    }

    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Number of selected classes, excluding "other".
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Number of network output channels: selected classes plus "other".
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.indices.len() + 1
    }

    /// Output channel of the synthetic "other" class.
    #[must_use]
    pub fn other_index(&self) -> usize {
        self.indices.len()
    }

    /// Largest known-class index in the selection.
    #[must_use]
    pub fn max_index(&self) -> usize {
        self.indices.iter().copied().max().unwrap_or(0)
    }

    /// Display colour for a network output channel.
    #[must_use]
    pub fn color(&self, output: usize) -> [u8; 3] {
        self.indices
            .get(output)
            .map(|&known| CITYSCAPES_PALETTE[known])
            .unwrap_or(OTHER_COLOR)
    }

    /// Name for a network output channel.
    #[must_use]
    pub fn name(&self, output: usize) -> &'static str {
        self.indices
            .get(output)
            .map(|&known| CITYSCAPES_CLASSES[known])
            .unwrap_or("other")
    }

    /// Run tag used for log and result directories, e.g. `VGG_skip_c19`.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("VGG_skip_c{}", self.indices.len())
    }
}

impl Default for ClassSet {
    fn default() -> Self {
        Self::all()
    }
}

impl TryFrom<Vec<usize>> for ClassSet {
    type Error = SceneSegError;

    fn try_from(indices: Vec<usize>) -> Result<Self> {
        Self::new(indices)
    }
}

impl From<ClassSet> for Vec<usize> {
    fn from(classes: ClassSet) -> Self {
        classes.indices
    }
}

impl fmt::Display for ClassSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .indices
            .iter()
            .map(|&idx| CITYSCAPES_CLASSES[idx])
            .collect();
        write!(f, "[{}] + other", names.join(", "))
    }
}
