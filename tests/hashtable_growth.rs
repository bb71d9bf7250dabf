mod common;

use common::run_ok;

/// Drives a script-level `dict` through enough insertions to force several
/// grow rehashes of the backing [`uncil::containers::hashtable::HashTable`]
/// (power-of-two capacity, 0.75 load factor), then confirms every key is
/// still reachable afterward.
#[test]
fn dict_survives_many_grow_rehashes() {
    let out = run_ok(
        "d = dict()\n\
         for i = 0, 9999 do d[tostring(i)] = i end\n\
         count = 0\n\
         for i = 0, 9999 do\n\
         if d[tostring(i)] == i then count = count + 1 end\n\
         end\n\
         print(count)",
    );
    assert_eq!(out, "10000\n");
}

#[test]
fn reinserting_an_existing_key_overwrites_without_disturbing_others() {
    let out = run_ok(
        "d = dict()\n\
         for i = 0, 999 do d[tostring(i)] = i end\n\
         for i = 0, 999 do d[tostring(i)] = i * 2 end\n\
         count = 0\n\
         for i = 0, 999 do\n\
         if d[tostring(i)] == i * 2 then count = count + 1 end\n\
         end\n\
         print(count)",
    );
    assert_eq!(out, "1000\n");
}
