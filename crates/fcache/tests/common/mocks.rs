use fcache::external::Linker;
use fcache::FragmentId;
use mockall::mock;

mock! {
    pub TestLinker {}
    impl Linker for TestLinker {
        fn unlink_incoming(&mut self, fragment: FragmentId);
        fn link_incoming(&mut self, old: FragmentId, new: FragmentId);
        fn unlink_and_stage_for_deletion(&mut self, chain: &[FragmentId]);
    }
}
