use crate::patch::LoadedDescriptor;

/// Splits descriptors into ordering-barrier groups.
///
/// Declaration order is kept, a descriptor with `await` closes the group it belongs to.
pub fn rank_descriptors(descriptors: Vec<LoadedDescriptor>) -> Vec<Vec<LoadedDescriptor>> {
    let mut groups = Vec::new();
    let mut current = Vec::new();
    for descriptor in descriptors {
        let barrier = descriptor.descriptor.await_;
        current.push(descriptor);
        if barrier {
            groups.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::manifest::Descriptor;

    fn loaded(name: &str, await_: bool) -> LoadedDescriptor {
        let mut descriptor = Descriptor::new(name);
        descriptor.await_ = await_;
        LoadedDescriptor::new(descriptor, "", format!("bundlebee/kubernetes/{name}.yaml"), "")
    }

    fn names(groups: &[Vec<LoadedDescriptor>]) -> Vec<Vec<&str>> {
        groups
            .iter()
            .map(|group| group.iter().map(LoadedDescriptor::name).collect())
            .collect()
    }

    #[rstest]
    #[case::barriers(
        vec![("A", true), ("B", false), ("C", true), ("D", false)],
        vec![vec!["A"], vec!["B", "C"], vec!["D"]]
    )]
    #[case::no_barrier(vec![("A", false), ("B", false)], vec![vec!["A", "B"]])]
    #[case::last_is_barrier(vec![("A", false), ("B", true)], vec![vec!["A", "B"]])]
    #[case::only_barriers(vec![("A", true), ("B", true)], vec![vec!["A"], vec!["B"]])]
    #[case::empty(vec![], vec![])]
    fn ranking(#[case] descriptors: Vec<(&str, bool)>, #[case] expected: Vec<Vec<&str>>) {
        let groups = rank_descriptors(
            descriptors
                .into_iter()
                .map(|(name, await_)| loaded(name, await_))
                .collect(),
        );

        assert_eq!(names(&groups), expected);
    }
}
