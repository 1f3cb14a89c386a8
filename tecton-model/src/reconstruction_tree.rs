//! Composed rotation hierarchy for one reconstruction time and anchor plate

use crate::rotation::{FiniteRotation, TotalReconstructionSequence};
use std::collections::{HashMap, VecDeque};
use tecton_types::{PlateId, ReconstructionTime};

/// One edge of a reconstruction tree.
#[derive(Debug, Clone)]
pub struct ReconstructionTreeEdge {
    pub fixed_plate: PlateId,
    pub moving_plate: PlateId,
    /// Rotation of the moving plate relative to the fixed plate.
    pub relative_rotation: FiniteRotation,
    /// Rotation of the moving plate relative to the anchor plate.
    pub composed_absolute_rotation: FiniteRotation,
    /// Moving plates of the edges hanging off this edge.
    pub children: Vec<PlateId>,
}

/// Immutable snapshot of the rotation hierarchy at one time relative to one
/// anchor plate.
#[derive(Debug, Clone)]
pub struct ReconstructionTree {
    reconstruction_time: ReconstructionTime,
    anchor_plate_id: PlateId,
    edges: HashMap<PlateId, ReconstructionTreeEdge>,
    root_edges: Vec<PlateId>,
}

impl ReconstructionTree {
    /// Compose the sequences valid at `time` into a tree rooted at `anchor`.
    ///
    /// Sequences are traversed forwards (fixed to moving) in preference to
    /// backwards; the first sequence to reach a plate wins.
    pub fn build<'a>(
        sequences: impl IntoIterator<Item = &'a TotalReconstructionSequence>,
        time: ReconstructionTime,
        anchor_plate_id: PlateId,
    ) -> Self {
        // plate -> [(neighbour, rotation of neighbour relative to plate)]
        let mut forward: HashMap<PlateId, Vec<(PlateId, FiniteRotation)>> = HashMap::new();
        let mut backward: HashMap<PlateId, Vec<(PlateId, FiniteRotation)>> = HashMap::new();

        for sequence in sequences {
            if sequence.fixed_plate == sequence.moving_plate {
                continue;
            }
            let Some(rotation) = sequence.rotation_at(time) else {
                continue;
            };
            forward
                .entry(sequence.fixed_plate)
                .or_default()
                .push((sequence.moving_plate, rotation));
            backward
                .entry(sequence.moving_plate)
                .or_default()
                .push((sequence.fixed_plate, rotation.reverse()));
        }

        let mut edges: HashMap<PlateId, ReconstructionTreeEdge> = HashMap::new();
        let mut root_edges = Vec::new();
        let mut queue = VecDeque::from([(anchor_plate_id, FiniteRotation::identity())]);

        while let Some((plate, composed)) = queue.pop_front() {
            let neighbours = forward
                .get(&plate)
                .into_iter()
                .flatten()
                .chain(backward.get(&plate).into_iter().flatten());

            for &(neighbour, relative) in neighbours {
                if neighbour == anchor_plate_id || edges.contains_key(&neighbour) {
                    continue;
                }
                let absolute = composed.compose(&relative);
                edges.insert(
                    neighbour,
                    ReconstructionTreeEdge {
                        fixed_plate: plate,
                        moving_plate: neighbour,
                        relative_rotation: relative,
                        composed_absolute_rotation: absolute,
                        children: Vec::new(),
                    },
                );
                if plate == anchor_plate_id {
                    root_edges.push(neighbour);
                } else if let Some(parent) = edges.get_mut(&plate) {
                    parent.children.push(neighbour);
                }
                queue.push_back((neighbour, absolute));
            }
        }

        ReconstructionTree {
            reconstruction_time: time,
            anchor_plate_id,
            edges,
            root_edges,
        }
    }

    pub fn reconstruction_time(&self) -> ReconstructionTime {
        self.reconstruction_time
    }

    pub fn anchor_plate_id(&self) -> PlateId {
        self.anchor_plate_id
    }

    pub fn edge(&self, moving_plate: PlateId) -> Option<&ReconstructionTreeEdge> {
        self.edges.get(&moving_plate)
    }

    pub fn root_edges(&self) -> impl Iterator<Item = &ReconstructionTreeEdge> {
        self.root_edges.iter().filter_map(|plate| self.edges.get(plate))
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Rotation of `plate` relative to the anchor, and whether the plate was
    /// found in the tree.
    ///
    /// Plates that cannot be reached from the anchor stay fixed to it, so the
    /// identity rotation is returned for them.
    pub fn composed_absolute_rotation(&self, plate: PlateId) -> (FiniteRotation, bool) {
        if plate == self.anchor_plate_id {
            return (FiniteRotation::identity(), true);
        }
        match self.edges.get(&plate) {
            Some(edge) => (edge.composed_absolute_rotation, true),
            None => (FiniteRotation::identity(), false),
        }
    }

    /// Rotation of `moving` relative to `fixed`.
    pub fn relative_rotation(&self, moving: PlateId, fixed: PlateId) -> FiniteRotation {
        let (moving_rotation, _) = self.composed_absolute_rotation(moving);
        let (fixed_rotation, _) = self.composed_absolute_rotation(fixed);
        fixed_rotation.reverse().compose(&moving_rotation)
    }
}
