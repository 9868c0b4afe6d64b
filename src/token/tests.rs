//! Tests for protected URL tokens

use super::*;
use proptest::prelude::*;
use secrecy::SecretString;

fn codec() -> TokenCodec {
    TokenCodec::new(&SecretString::new("test-secret".to_string())).unwrap()
}

fn size_strategy() -> impl Strategy<Value = SizeClass> {
    prop_oneof![
        Just(SizeClass::Thumbnail),
        Just(SizeClass::Medium),
        Just(SizeClass::Large),
        Just(SizeClass::Full),
        (1u32..5000, 1u32..5000).prop_map(|(width, height)| SizeClass::Custom { width, height }),
    ]
}

#[test]
fn test_mint_is_deterministic_hex() {
    let codec = codec();
    let a = codec.mint(AttachmentId(5), ItemId(9), SizeClass::Full);
    let b = codec.mint(AttachmentId(5), ItemId(9), SizeClass::Full);
    assert_eq!(a, b);
    assert_eq!(a.len(), TOKEN_HEX_LEN);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_different_secrets_disagree() {
    let other = TokenCodec::new(&SecretString::new("other".to_string())).unwrap();
    let token = codec().mint(AttachmentId(1), ItemId(2), SizeClass::Medium);
    assert!(!other.verify(AttachmentId(1), ItemId(2), SizeClass::Medium, &token));
}

#[test]
fn test_empty_secret_rejected() {
    assert!(TokenCodec::new(&SecretString::new(String::new())).is_err());
}

#[test]
fn test_malformed_tokens_fail_closed() {
    let codec = codec();
    let token = codec.mint(AttachmentId(1), ItemId(2), SizeClass::Full);
    assert!(!codec.verify(AttachmentId(1), ItemId(2), SizeClass::Full, ""));
    assert!(!codec.verify(AttachmentId(1), ItemId(2), SizeClass::Full, &token[..63]));
    assert!(!codec.verify(AttachmentId(1), ItemId(2), SizeClass::Full, &"zz".repeat(32)));
    assert!(!codec.verify(AttachmentId(0), ItemId(2), SizeClass::Full, &token));
    let zero_item = codec.mint(AttachmentId(1), ItemId(0), SizeClass::Full);
    assert!(!codec.verify(AttachmentId(1), ItemId(0), SizeClass::Full, &zero_item));
}

#[test]
fn test_url_roundtrip_through_minter() {
    let minter = UrlMinter::new(codec(), "https://cdn.example/protected");
    let url = minter.mint_url(AttachmentId(42), ItemId(7), SizeClass::Custom { width: 300, height: 200 });
    assert!(url.starts_with("https://cdn.example/protected?protected_image=42&item=7&size=300x200&token="));

    let parsed = ProtectedUrl::parse(&url).unwrap();
    assert_eq!(parsed.attachment, AttachmentId(42));
    assert!(minter.codec().verify_url(&parsed));
}

#[test]
fn test_base_with_existing_query() {
    let url = ProtectedUrl {
        attachment: AttachmentId(1),
        item: ItemId(2),
        size: SizeClass::Full,
        token: "ab".into(),
    };
    assert_eq!(
        url.to_url("/index.php?route=img"),
        "/index.php?route=img&protected_image=1&item=2&size=full&token=ab"
    );
}

#[test]
fn test_from_query_rejects_missing_or_bad_fields() {
    assert!(ProtectedUrl::from_query("protected_image=1&item=2").is_none());
    assert!(ProtectedUrl::from_query("protected_image=x&item=2&token=aa").is_none());
    assert!(ProtectedUrl::from_query("protected_image=1&item=2&size=huge&token=aa").is_none());
    let parsed = ProtectedUrl::from_query("protected_image=1&item=2&token=aa").unwrap();
    assert_eq!(parsed.size, SizeClass::Full);
}

#[test]
fn test_base_ending_in_separator_still_verifies() {
    let minter = UrlMinter::new(codec(), "/p?x=1&");
    let url = minter.mint_url(AttachmentId(3), ItemId(4), SizeClass::Full);
    assert!(url.starts_with("/p?x=1&protected_image=3&item=4"));
    assert!(!url.contains("&&"));
    let parsed = ProtectedUrl::parse(&url).unwrap();
    assert!(minter.codec().verify_url(&parsed));

    let bare = UrlMinter::new(codec(), "/p?");
    assert!(bare.mint_url(AttachmentId(3), ItemId(4), SizeClass::Full).starts_with("/p?protected_image=3"));
}

#[test]
fn test_from_query_decodes_percent_encoding_and_empty_pairs() {
    let parsed = ProtectedUrl::from_query("&&protected_image=1&item=2&size=200%78300&token=a%62").unwrap();
    assert_eq!(parsed.size, SizeClass::Custom { width: 200, height: 300 });
    assert_eq!(parsed.token, "ab");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A minted token verifies for its own tuple
    #[test]
    fn prop_minted_token_verifies(a in 1u64..u64::MAX, i in 1u64..u64::MAX, size in size_strategy()) {
        let codec = codec();
        let token = codec.mint(AttachmentId(a), ItemId(i), size);
        prop_assert!(codec.verify(AttachmentId(a), ItemId(i), size, &token));
    }

    /// Changing any component of the tuple invalidates the token
    #[test]
    fn prop_token_bound_to_tuple(
        a in 1u64..1_000_000,
        i in 1u64..1_000_000,
        size in size_strategy(),
        delta in 1u64..1000,
    ) {
        let codec = codec();
        let token = codec.mint(AttachmentId(a), ItemId(i), size);
        prop_assert!(!codec.verify(AttachmentId(a + delta), ItemId(i), size, &token));
        prop_assert!(!codec.verify(AttachmentId(a), ItemId(i + delta), size, &token));
        let other_size = if size == SizeClass::Thumbnail { SizeClass::Large } else { SizeClass::Thumbnail };
        prop_assert!(!codec.verify(AttachmentId(a), ItemId(i), other_size, &token));
    }

    /// A flipped hex digit invalidates the token
    #[test]
    fn prop_tampered_token_rejected(a in 1u64..1_000_000, i in 1u64..1_000_000, pos in 0usize..TOKEN_HEX_LEN) {
        let codec = codec();
        let token = codec.mint(AttachmentId(a), ItemId(i), SizeClass::Full);
        let mut chars: Vec<char> = token.chars().collect();
        chars[pos] = if chars[pos] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        prop_assert!(!codec.verify(AttachmentId(a), ItemId(i), SizeClass::Full, &tampered));
    }
}
