//! Chains, groups and chords
//!
//! Compositions are built out of plain signatures before publish: a chain
//! nests each signature into its predecessor's success callbacks, a group
//! stamps a shared group UUID onto its members, and a chord additionally
//! stamps the callback onto every member so whichever worker completes
//! the group last can dispatch it.

use uuid::Uuid;

use crate::signature::Signature;

/// Sequential composition; each task's results feed the next task's args
#[derive(Debug, Clone)]
pub struct Chain {
    /// Members in execution order; the head carries the nested tail
    pub signatures: Vec<Signature>,
}

impl Chain {
    /// Link signatures into a chain. Each member's success callback is
    /// set to its successor, so publishing the head publishes the chain.
    pub fn new(signatures: Vec<Signature>) -> Self {
        let mut linked: Vec<Signature> = Vec::with_capacity(signatures.len());
        for mut signature in signatures.into_iter().rev() {
            signature.ensure_uuid();
            if let Some(successor) = linked.last() {
                signature.on_success = vec![successor.clone()];
            }
            linked.push(signature);
        }
        linked.reverse();
        Self { signatures: linked }
    }

    /// The first signature, carrying the whole chain
    pub fn head(&self) -> Option<&Signature> {
        self.signatures.first()
    }
}

/// Parallel fan-out of independent signatures
#[derive(Debug, Clone)]
pub struct Group {
    /// Freshly minted identifier shared by all members
    pub group_uuid: String,
    /// Members, mutually unordered at execution time
    pub signatures: Vec<Signature>,
}

impl Group {
    /// Stamp signatures with a new group UUID and the member count
    pub fn new(signatures: Vec<Signature>) -> Self {
        let group_uuid = Uuid::new_v4().to_string();
        let count = signatures.len();
        let signatures = signatures
            .into_iter()
            .map(|mut signature| {
                signature.ensure_uuid();
                signature.group_uuid = Some(group_uuid.clone());
                signature.group_task_count = Some(count);
                signature
            })
            .collect();
        Self {
            group_uuid,
            signatures,
        }
    }

    /// Member UUIDs in insertion order
    pub fn task_uuids(&self) -> Vec<String> {
        self.signatures.iter().map(|s| s.uuid.clone()).collect()
    }
}

/// A group plus a callback dispatched once every member has succeeded
#[derive(Debug, Clone)]
pub struct Chord {
    pub group: Group,
    pub callback: Signature,
}

impl Chord {
    /// Attach a callback to a group. The callback's args are filled with
    /// the flattened group results at dispatch time unless it is
    /// immutable.
    pub fn new(group: Group, mut callback: Signature) -> Self {
        callback.ensure_uuid();
        let signatures = group
            .signatures
            .into_iter()
            .map(|mut signature| {
                signature.chord_callback = Some(Box::new(callback.clone()));
                signature
            })
            .collect();
        Self {
            group: Group {
                group_uuid: group.group_uuid,
                signatures,
            },
            callback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::TypedValue;

    #[test]
    fn chain_nests_successors_into_the_head() {
        let chain = Chain::new(vec![
            Signature::new("add", vec![TypedValue::int64(1), TypedValue::int64(2)]),
            Signature::new("multiply", vec![TypedValue::int64(4)]),
            Signature::new("report", vec![]),
        ]);

        let head = chain.head().unwrap();
        assert_eq!(head.name, "add");
        assert_eq!(head.on_success.len(), 1);
        assert_eq!(head.on_success[0].name, "multiply");
        assert_eq!(head.on_success[0].on_success[0].name, "report");

        // The flat list keeps the same UUIDs as the nested copies.
        assert_eq!(chain.signatures[1].uuid, head.on_success[0].uuid);
        assert_eq!(
            chain.signatures[2].uuid,
            head.on_success[0].on_success[0].uuid
        );
    }

    #[test]
    fn group_stamps_members() {
        let group = Group::new(vec![
            Signature::new("add", vec![]),
            Signature::new("add", vec![]),
        ]);

        assert_eq!(group.signatures.len(), 2);
        for signature in &group.signatures {
            assert_eq!(signature.group_uuid.as_deref(), Some(group.group_uuid.as_str()));
            assert_eq!(signature.group_task_count, Some(2));
        }
        assert_ne!(group.signatures[0].uuid, group.signatures[1].uuid);
    }

    #[test]
    fn chord_stamps_callback_onto_every_member() {
        let group = Group::new(vec![
            Signature::new("add", vec![]),
            Signature::new("add", vec![]),
        ]);
        let chord = Chord::new(group, Signature::new("sum", vec![]));

        for signature in &chord.group.signatures {
            let callback = signature.chord_callback.as_ref().unwrap();
            assert_eq!(callback.name, "sum");
            assert_eq!(callback.uuid, chord.callback.uuid);
        }
    }
}
