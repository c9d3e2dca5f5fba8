#![no_main]
use flashlog::core::node::GroupFlag;
use flashlog::Node;
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must decode to a node or an error, never panic, and
// whatever decodes must encode to something of the same type
fuzz_target!(|data: &[u8]| {
    if let Ok((header, node)) = Node::decode(data, 8, 0) {
        let again = node.encode(header.sqnum, GroupFlag::None);
        if let Ok((_, decoded)) = Node::decode(&again, 8, 0) {
            assert_eq!(decoded.node_type(), node.node_type());
        }
    }
});
