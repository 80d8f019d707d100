use crate::store::s3::copy_source;

#[test]
fn test_plain_keys_pass_through() {
    assert_eq!(copy_source("tidefs", "docs/notes.md"), "tidefs/docs/notes.md");
    assert_eq!(
        copy_source("tidefs", "_versions/docs/notes.md/3"),
        "tidefs/_versions/docs/notes.md/3"
    );
}

#[test]
fn test_reserved_characters_are_encoded() {
    assert_eq!(copy_source("b", "a file.txt"), "b/a%20file.txt");
    assert_eq!(copy_source("b", "q?.txt"), "b/q%3F.txt");
    assert_eq!(copy_source("b", "50%.txt"), "b/50%25.txt");
    assert_eq!(copy_source("b", "a#b&c+d"), "b/a%23b%26c%2Bd");
}

#[test]
fn test_non_ascii_keys_are_encoded() {
    assert_eq!(copy_source("b", "héllo.txt"), "b/h%C3%A9llo.txt");
}

#[test]
fn test_slashes_and_unreserved_stay_verbatim() {
    assert_eq!(copy_source("b", "a-b_c.~d/e"), "b/a-b_c.~d/e");
}
