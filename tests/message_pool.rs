use std::any::TypeId;

use shardline::{
    error::PoolError,
    message::{downcast, pool::PoolConfig, Message, PoolFlag},
    MessagePool,
};

#[derive(Message, Clone, Default, Debug)]
#[message(op_code = 1001)]
struct MoveTo {
    #[message(pool_flag)]
    pooled: PoolFlag,
    x: i32,
    y: i32,
}

#[derive(Message, Default)]
#[message(op_code = 1002)]
struct Chat {
    flag: PoolFlag,
    text: String,
}

#[test]
fn derive_implements_message() {
    let msg = MoveTo::default();
    assert_eq!(msg.op_code(), 1001);
    assert!(!msg.pool_flag().is_on_loan());

    // the single PoolFlag field is found without an attribute
    let chat = Chat::default();
    assert_eq!(chat.op_code(), 1002);
    assert!(!chat.flag.is_on_loan());
    assert!(chat.text.is_empty());
}

#[test]
fn rented_instances_are_reused() {
    let mut pool = MessagePool::new();
    let mut msg = pool.rent::<MoveTo>();
    assert!(msg.pool_flag().is_on_loan());
    msg.x = 4;
    let addr = &*msg as *const MoveTo;

    assert!(pool.return_message(msg));
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.len_of::<MoveTo>(), 1);

    let again = pool.rent::<MoveTo>();
    assert_eq!(&*again as *const MoveTo, addr);
    assert!(again.pool_flag().is_on_loan());
    assert!(pool.is_empty());
}

#[test]
fn returning_twice_is_a_no_op() {
    let mut pool = MessagePool::new();
    let msg = pool.rent::<MoveTo>();
    let copy = MoveTo::clone(&msg);

    assert!(pool.return_message(msg));
    // a clone was never on loan
    assert!(!copy.pool_flag().is_on_loan());
    assert!(!pool.return_message(Box::new(copy)));
    assert_eq!(pool.len(), 1);

    let msg = pool.rent::<MoveTo>();
    assert!(pool.return_message(msg));
    let mut msg = pool.rent::<MoveTo>();
    assert!(pool.return_message(std::mem::take(&mut msg)));
    // the emptied box holds a fresh default, which is not on loan
    assert!(!pool.return_message(msg));
    assert_eq!(pool.len(), 1);
}

#[test]
fn hand_built_messages_are_rejected() {
    let mut pool = MessagePool::new();
    assert!(!pool.return_message(Box::new(MoveTo::default())));
    assert!(pool.is_empty());
}

#[test]
fn full_pool_drops_returns() {
    let mut pool = MessagePool::with_config(PoolConfig { max_capacity: 2 });
    let rented: Vec<_> = (0..3).map(|_| pool.rent::<MoveTo>()).collect();
    let results: Vec<_> = rented
        .into_iter()
        .map(|msg| pool.return_message(msg))
        .collect();

    assert_eq!(results, vec![true, true, false]);
    assert_eq!(pool.len(), 2);
    assert_eq!(pool.capacity(), 2);
}

#[test]
fn capacity_is_shared_across_types() {
    let mut pool = MessagePool::with_config(PoolConfig { max_capacity: 1 });
    let a = pool.rent::<MoveTo>();
    let b = pool.rent::<Chat>();
    assert!(pool.return_message(a));
    assert!(!pool.return_message(b));
}

#[test]
fn rent_by_op_code() {
    let mut pool = MessagePool::new();
    assert!(pool.register::<MoveTo>());
    assert!(!pool.register::<MoveTo>());
    assert!(pool.is_registered::<MoveTo>());

    let msg = pool.rent_by_op_code(1001).unwrap();
    assert!(msg.is::<MoveTo>());
    assert!(msg.pool_flag().is_on_loan());
    assert!(pool.return_dyn(msg));

    let msg = pool.rent_dyn(TypeId::of::<MoveTo>()).unwrap();
    let Ok(msg) = downcast::<MoveTo>(msg) else {
        panic!("rented the wrong type");
    };
    assert!(msg.pool_flag().is_on_loan());

    assert_eq!(
        pool.rent_by_op_code(9).err(),
        Some(PoolError::UnknownOpCode(9))
    );
    assert_eq!(
        pool.rent_dyn(TypeId::of::<Chat>()).err(),
        Some(PoolError::UnregisteredType {
            type_id: TypeId::of::<Chat>()
        })
    );
}

#[test]
fn downcast_hands_back_the_wrong_type() {
    let msg: Box<dyn Message> = Box::new(Chat::default());
    let msg = downcast::<MoveTo>(msg).unwrap_err();
    assert!(msg.downcast_ref::<Chat>().is_some());
}

#[test]
fn clear_forgets_everything() {
    let mut pool = MessagePool::new();
    let msg = pool.rent::<MoveTo>();
    pool.return_message(msg);

    pool.clear();
    assert!(pool.is_empty());
    assert!(!pool.is_registered::<MoveTo>());
}
