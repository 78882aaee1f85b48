use super::*;

#[test]
fn test_validate_key() {
    assert!(validate_key(b"a", 255).is_ok());
    assert!(validate_key(&[0_u8; 255], 255).is_ok());

    assert!(validate_key(b"", 255).is_err());
    assert!(validate_key(&[0_u8; 256], 255).is_err());
    assert!(validate_key(b"toolong", 4).is_err());
}

#[test]
fn test_partition() {
    // every item lands in exactly one span, spans are contiguous.
    for m in 0..100 {
        for total in 1..8 {
            let mut prev_end = 0;
            for id in 0..total {
                let (beg, end) = partition(m, total, id);
                assert_eq!(beg, prev_end, "m:{} total:{} id:{}", m, total, id);
                assert!(end >= beg);
                prev_end = end;
            }
            assert_eq!(prev_end, m, "m:{} total:{}", m, total);
        }
    }

    assert_eq!(partition(10, 4, 0), (0, 3));
    assert_eq!(partition(10, 4, 1), (3, 6));
    assert_eq!(partition(10, 4, 2), (6, 9));
    assert_eq!(partition(10, 4, 3), (9, 10));
    assert_eq!(partition(2, 4, 3), (2, 2));
}
