//! Basic usage example for `HandleTable`.
//!
//! This example demonstrates how a resource cache can hand out long-lived handles to untyped
//! item memory, share items between owners and detect handles to released items.

use stable_memory::{Handle, HandleTable};

#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct Texture {
    width: u32,
    height: u32,
}

fn read(table: &HandleTable, handle: Handle) -> Option<Texture> {
    table.get(handle).map(|ptr| {
        // SAFETY: The table was created with the layout of Texture and every item is written
        // right after insertion.
        unsafe { ptr.cast::<Texture>().read() }
    })
}

fn main() {
    let mut textures = HandleTable::builder().layout_of::<Texture>().build();

    let (grass, ptr) = textures.insert();
    // SAFETY: The table was created with the layout of Texture.
    unsafe {
        ptr.cast::<Texture>().write(Texture {
            width: 256,
            height: 256,
        });
    }

    println!("Inserted {grass:?}: {:?}", read(&textures, grass));

    // A second owner shares the same texture.
    let (shared, _) = textures
        .make_shared(grass)
        .expect("handle was just issued");
    println!(
        "Shared {shared:?}, references: {:?}",
        textures.references(grass)
    );

    // The first owner is done with it; the texture stays alive for the second one.
    let remaining = textures.remove(grass, None);
    println!("After first release, references left: {remaining:?}");

    // The last owner releases it, after which the handle is stale.
    let remaining = textures.remove(shared, None);
    println!("After second release, references left: {remaining:?}");

    // The slot is reused, but the old handle does not resolve to the new texture.
    let (stone, ptr) = textures.insert();
    // SAFETY: The table was created with the layout of Texture.
    unsafe {
        ptr.cast::<Texture>().write(Texture {
            width: 512,
            height: 128,
        });
    }

    println!("Inserted {stone:?} into the same slot as {grass:?}");
    println!("Stale handle resolves to: {:?}", read(&textures, grass));
    println!("New handle resolves to: {:?}", read(&textures, stone));

    assert!(textures.get(grass).is_none());
    assert_eq!(stone.index(), grass.index());

    println!(
        "Table has {} items with capacity {}",
        textures.len(),
        textures.capacity()
    );
}
